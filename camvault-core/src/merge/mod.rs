//! Per-camera concatenation with gap-budget enforcement and content-hash
//! overlap trimming.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Timelike;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, warn};

use crate::fsutil::{ensure_dir, replace_file};
use crate::media::{ConcatPart, Concatenator, FrameHasher, MediaError};
use crate::segment::{GapReport, SegmentError};
use crate::verdict::JobVerdict;

pub type MergeResult<T> = std::result::Result<T, MergeError>;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error(transparent)]
    Report(#[from] SegmentError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("no segment files to merge in {dir}")]
    NoSegments { dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Business-hours window charged against the gap budget.
    pub window_start_hour: u8,
    pub window_end_hour: u8,
    /// Total missing seconds tolerated inside the window.
    pub gap_tolerance: f64,
    /// Merge even when some segments could still improve with retries.
    pub tolerate_incomplete: bool,
    /// Retry limit segments are judged against when deciding whether they
    /// are still improvable.
    pub max_retries: u32,
    pub nominal_duration: f64,
    pub segment_ext: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            window_start_hour: 8,
            window_end_hour: 20,
            gap_tolerance: 120.0,
            tolerate_incomplete: false,
            max_retries: 2,
            nominal_duration: 900.0,
            segment_ext: "flv".into(),
        }
    }
}

/// One camera directory's merge: sources plus the tmp/dst output pair.
#[derive(Debug, Clone)]
pub struct MergeJob {
    pub srcdir: PathBuf,
    pub tmp: PathBuf,
    pub dst: PathBuf,
    pub force: bool,
}

#[derive(Debug, Default)]
struct SlotAudit {
    missing_seconds: f64,
    /// Slots with gaps whose attempt counter has not reached the limit.
    unfinished: Vec<(u8, u8)>,
}

pub struct MergeEngine {
    hasher: Arc<dyn FrameHasher>,
    concatenator: Arc<dyn Concatenator>,
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(
        hasher: Arc<dyn FrameHasher>,
        concatenator: Arc<dyn Concatenator>,
        config: MergeConfig,
    ) -> Self {
        Self {
            hasher,
            concatenator,
            config,
        }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Merge every segment in the camera directory into one continuous
    /// file. `Skipped` when the destination already exists without force,
    /// `Failed` when the gap budget or completeness policy refuses.
    pub async fn merge_camera_dir(&self, job: &MergeJob) -> MergeResult<JobVerdict> {
        if fs::try_exists(&job.dst).await.unwrap_or(false) && !job.force {
            debug!(dst = %job.dst.display(), "merged file already exists (force required)");
            return Ok(JobVerdict::Skipped);
        }

        let audit = self.audit_reports(&job.srcdir).await?;
        if audit.missing_seconds > self.config.gap_tolerance {
            warn!(
                srcdir = %job.srcdir.display(),
                missing_s = audit.missing_seconds,
                tolerance_s = self.config.gap_tolerance,
                "missing seconds inside the business window exceed the merge tolerance"
            );
            return Ok(JobVerdict::Failed);
        }

        for (hour, minute) in &audit.unfinished {
            warn!(
                srcdir = %job.srcdir.display(),
                slot = %format!("{hour:02}:{minute:02}"),
                "segment is incomplete and still has retry attempts left"
            );
        }
        if !audit.unfinished.is_empty() && !self.config.tolerate_incomplete {
            return Ok(JobVerdict::Failed);
        }

        let files = self.segment_files(&job.srcdir).await?;
        if files.is_empty() {
            return Err(MergeError::NoSegments {
                dir: job.srcdir.clone(),
            });
        }

        let parts = self.plan_concat(&files).await?;
        if let Some(parent) = job.tmp.parent() {
            ensure_dir(parent).await.map_err(|source| MergeError::Io {
                source,
                path: parent.to_path_buf(),
            })?;
        }
        self.concatenator.concat(&parts, &job.tmp).await?;
        replace_file(&job.tmp, &job.dst)
            .await
            .map_err(|source| MergeError::Io {
                source,
                path: job.dst.clone(),
            })?;
        debug!(dst = %job.dst.display(), parts = parts.len(), "camera directory merged");
        Ok(JobVerdict::Success)
    }

    /// Expected quarter-hour slots inside the business window.
    fn expected_slots(&self) -> BTreeSet<(u8, u8)> {
        let mut slots = BTreeSet::new();
        for hour in self.config.window_start_hour..self.config.window_end_hour {
            for minute in [0u8, 15, 30, 45] {
                slots.insert((hour, minute));
            }
        }
        slots
    }

    /// Charge every expected slot: its report's gap length if present, the
    /// full nominal duration if entirely missing. Unreadable sidecars are
    /// logged and treated as missing.
    async fn audit_reports(&self, srcdir: &Path) -> MergeResult<SlotAudit> {
        let mut expected = self.expected_slots();
        let mut audit = SlotAudit::default();

        for sidecar in self.sidecar_files(srcdir).await? {
            let report = match GapReport::load(&sidecar).await {
                Ok(report) => report,
                Err(err) => {
                    error!(sidecar = %sidecar.display(), error = %err, "malformed gap report");
                    continue;
                }
            };
            debug!(sidecar = %sidecar.display(), "checking gap report");
            let slot = (report.localtime.hour() as u8, report.localtime.minute() as u8);
            let gap = report.gap_length(self.config.nominal_duration);
            if gap > 0.0 && report.attempts < self.config.max_retries {
                audit.unfinished.push(slot);
            }
            if expected.remove(&slot) {
                audit.missing_seconds += gap;
            }
        }

        for (hour, minute) in &expected {
            error!(
                srcdir = %srcdir.display(),
                slot = %format!("{hour:02}:{minute:02}"),
                "missing segment"
            );
            audit.missing_seconds += self.config.nominal_duration;
        }
        Ok(audit)
    }

    async fn sidecar_files(&self, srcdir: &Path) -> MergeResult<Vec<PathBuf>> {
        self.list_files(srcdir, |name| name.ends_with(".gapreport.json"))
            .await
    }

    async fn segment_files(&self, srcdir: &Path) -> MergeResult<Vec<PathBuf>> {
        let suffix = format!(".{}", self.config.segment_ext);
        self.list_files(srcdir, |name| name.ends_with(&suffix)).await
    }

    async fn list_files(
        &self,
        srcdir: &Path,
        matches: impl Fn(&str) -> bool,
    ) -> MergeResult<Vec<PathBuf>> {
        let mut entries = fs::read_dir(srcdir)
            .await
            .map_err(|source| MergeError::Io {
                source,
                path: srcdir.to_path_buf(),
            })?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|source| MergeError::Io {
            source,
            path: srcdir.to_path_buf(),
        })? {
            let name = entry.file_name();
            if matches(&name.to_string_lossy()) {
                files.push(entry.path());
            }
        }
        // Zero-padded slot names make the lexical order chronological.
        files.sort();
        Ok(files)
    }

    /// Decide concat trim points. Files are processed latest to earliest:
    /// each file's first-frame hash is searched backward through the
    /// preceding file's frames, and the preceding file is cut after the
    /// most recent exact match. Re-downloaded overlap is frame-identical
    /// rather than time-aligned, so only content identity is consulted.
    async fn plan_concat(&self, files: &[PathBuf]) -> MergeResult<Vec<ConcatPart>> {
        let mut parts: Vec<ConcatPart> = Vec::with_capacity(files.len());
        let mut boundary_hash: Option<String> = None;

        for file in files.iter().rev() {
            let hashes = self.hasher.frame_hashes(file).await?;
            let mut outpoint = None;
            if let Some(hash) = &boundary_hash {
                // Skip the first frame: a whole-file match would zero the
                // part out entirely.
                for frame in hashes.frames.iter().skip(1).rev() {
                    if frame.hash == *hash {
                        outpoint = Some(hashes.pts_seconds(frame));
                        break;
                    }
                }
            }
            if let Some(point) = outpoint {
                debug!(file = %file.display(), outpoint = point, "trimming overlap");
            }
            parts.push(ConcatPart {
                path: file.clone(),
                outpoint,
            });
            boundary_hash = hashes.first_hash().map(str::to_string);
        }

        parts.reverse();
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_window_has_48_quarter_hour_slots() {
        let engine_config = MergeConfig::default();
        let engine = MergeEngine::new(
            Arc::new(NullHasher),
            Arc::new(NullConcat),
            engine_config,
        );
        let slots = engine.expected_slots();
        assert_eq!(slots.len(), 48);
        assert!(slots.contains(&(8, 0)));
        assert!(slots.contains(&(19, 45)));
        assert!(!slots.contains(&(20, 0)));
        assert!(!slots.contains(&(7, 45)));
    }

    struct NullHasher;

    #[async_trait::async_trait]
    impl FrameHasher for NullHasher {
        async fn frame_hashes(&self, _path: &Path) -> crate::media::MediaResult<crate::media::FrameHashes> {
            Ok(crate::media::FrameHashes {
                timebase_num: 1,
                timebase_den: 1000,
                frames: Vec::new(),
            })
        }
    }

    struct NullConcat;

    #[async_trait::async_trait]
    impl Concatenator for NullConcat {
        async fn concat(
            &self,
            _parts: &[ConcatPart],
            _dest: &Path,
        ) -> crate::media::MediaResult<()> {
            Ok(())
        }
    }
}
