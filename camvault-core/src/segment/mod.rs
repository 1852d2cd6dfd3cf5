//! Segment acquisition: fetch one fixed-duration segment, keep the best
//! copy across repeated invocations, bound total attempts, never lose
//! prior quality.

mod report;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tokio::fs;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::fsutil::{ensure_dir, replace_file};
use crate::media::{MediaError, MediaProbe, SegmentFetcher};
use crate::verdict::JobVerdict;

pub use report::{GapReport, GapSpan};

pub type SegmentResult<T> = std::result::Result<T, SegmentError>;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("malformed gap report {path}: {source}")]
    MalformedReport {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error(transparent)]
    Media(#[from] MediaError),
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub max_retries: u32,
    /// Nominal segment duration in seconds.
    pub nominal_duration: f64,
    /// Largest tolerated spacing between consecutive presentation
    /// timestamps before a gap is recorded.
    pub pts_tolerance: f64,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            nominal_duration: 900.0,
            pts_tolerance: 2.0,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 10,
        }
    }
}

impl AcquisitionConfig {
    fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_factor.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(multiplier)
    }
}

/// One segment's worth of work: where to fetch into and where the kept
/// copy lives. Each job owns a distinct tmp/dst pair.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub camera_id: String,
    /// Slot start in the camera's local offset.
    pub start: DateTime<FixedOffset>,
    pub tmp: PathBuf,
    pub dst: PathBuf,
    /// Reset the persisted attempt counter; prior gap metrics stay as the
    /// baseline to beat.
    pub force: bool,
}

pub struct SegmentAcquisition {
    fetcher: Arc<dyn SegmentFetcher>,
    probe: Arc<dyn MediaProbe>,
    config: AcquisitionConfig,
}

impl SegmentAcquisition {
    pub fn new(
        fetcher: Arc<dyn SegmentFetcher>,
        probe: Arc<dyn MediaProbe>,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            fetcher,
            probe,
            config,
        }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Fetch the segment with the retry-with-best-of-N policy. Returns
    /// `Success` once the kept copy is clean, `Failed` when the attempt
    /// budget is exhausted with gaps remaining. Fetch or probe breakage
    /// surfaces as an error instead of a verdict.
    pub async fn process(&self, job: &SegmentJob) -> SegmentResult<JobVerdict> {
        let sidecar = GapReport::sidecar_path(&job.dst);
        let nominal = self.config.nominal_duration;
        let mut baseline: Option<GapReport> = None;
        let mut prior_attempts = 0;

        if fs::try_exists(&sidecar).await.unwrap_or(false) {
            match GapReport::load(&sidecar).await {
                Ok(mut report) => {
                    if job.force {
                        report.attempts = 0;
                    } else {
                        prior_attempts = report.attempts;
                    }
                    let gap = report.gap_length(nominal);
                    if gap == 0.0 {
                        debug!(
                            camera_id = %job.camera_id,
                            segment = %job.dst.display(),
                            "segment already downloaded without gaps"
                        );
                        return Ok(JobVerdict::Success);
                    }
                    if report.attempts >= self.config.max_retries {
                        debug!(
                            camera_id = %job.camera_id,
                            segment = %job.dst.display(),
                            "segment has gaps and no attempts left (force required)"
                        );
                        return Ok(JobVerdict::Failed);
                    }
                    debug!(
                        camera_id = %job.camera_id,
                        remaining = self.config.max_retries - report.attempts,
                        "segment has gaps, resuming attempts"
                    );
                    baseline = Some(report);
                }
                Err(err) => {
                    // Unreadable history: proceed as if absent.
                    error!(sidecar = %sidecar.display(), error = %err, "malformed gap report");
                }
            }
        }

        for dir in [job.tmp.parent(), job.dst.parent()].into_iter().flatten() {
            ensure_dir(dir).await.map_err(|source| SegmentError::Io {
                source,
                path: dir.to_path_buf(),
            })?;
        }

        let mut kept_gap = baseline.as_ref().map(|report| report.gap_length(nominal));
        for attempt in prior_attempts + 1..=self.config.max_retries {
            debug!(camera_id = %job.camera_id, attempt, "starting download");
            self.fetcher
                .fetch(&job.camera_id, job.start, &job.tmp)
                .await?;
            let fresh = self.analyze(&job.tmp, job.start).await?;
            let fresh_gap = fresh.gap_length(nominal);

            let better = kept_gap.map_or(true, |current| fresh_gap < current);
            let mut report = if better {
                if kept_gap.unwrap_or(0.0) > 0.0 {
                    info!(
                        camera_id = %job.camera_id,
                        old_gap = kept_gap,
                        new_gap = fresh_gap,
                        "new file is better and will replace current"
                    );
                }
                replace_file(&job.tmp, &job.dst)
                    .await
                    .map_err(|source| SegmentError::Io {
                        source,
                        path: job.dst.clone(),
                    })?;
                kept_gap = Some(fresh_gap);
                fresh
            } else {
                // Keep the existing destination and its metrics.
                let _ = fs::remove_file(&job.tmp).await;
                baseline.clone().unwrap_or(fresh)
            };

            // Persist progress after every attempt so a crash mid-run
            // resumes instead of restarting.
            report.attempts = attempt;
            report.save(&sidecar).await?;
            baseline = Some(report);

            if fresh_gap == 0.0 {
                return Ok(JobVerdict::Success);
            }
            if attempt < self.config.max_retries {
                let wait = self.config.backoff(attempt);
                debug!(
                    camera_id = %job.camera_id,
                    gap = fresh_gap,
                    wait_s = wait.as_secs(),
                    "segment has gaps, retrying after backoff"
                );
                sleep(wait).await;
            }
        }

        debug!(camera_id = %job.camera_id, "last attempt failed, file has gaps");
        Ok(JobVerdict::Failed)
    }

    /// Gap analysis over the file's presentation timestamps.
    pub async fn analyze(
        &self,
        path: &std::path::Path,
        localtime: DateTime<FixedOffset>,
    ) -> SegmentResult<GapReport> {
        let timestamps = self.probe.packet_timestamps(path).await?;
        let mut report = GapReport::new(localtime);

        let Some(&last) = timestamps.last() else {
            report.invalid_file = true;
            return Ok(report);
        };
        if last < self.config.nominal_duration {
            report.duration_error = Some(self.config.nominal_duration - last);
        }
        for pair in timestamps.windows(2) {
            let diff = pair[1] - pair[0];
            if diff > self.config.pts_tolerance {
                report.gaps.push(GapSpan {
                    start: pair[0] as i64,
                    len: diff,
                });
            }
        }
        Ok(report)
    }
}
