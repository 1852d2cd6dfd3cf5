use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use camvault_core::media::{MediaError, MediaProbe, MediaResult, SegmentFetcher};
use camvault_core::{AcquisitionConfig, GapReport, JobVerdict, SegmentAcquisition, SegmentJob};
use chrono::{DateTime, FixedOffset};

struct MockFetcher {
    calls: AtomicUsize,
}

impl MockFetcher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SegmentFetcher for MockFetcher {
    async fn fetch(
        &self,
        _camera_id: &str,
        _start: DateTime<FixedOffset>,
        dest: &Path,
    ) -> MediaResult<()> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::fs::write(dest, format!("attempt-{attempt}"))
            .await
            .map_err(|source| MediaError::Io {
                source,
                path: dest.to_path_buf(),
            })
    }
}

/// Returns one scripted timestamp list per probe call; erroring out when
/// the script runs dry.
struct ScriptedProbe {
    timestamps: Mutex<VecDeque<Vec<f64>>>,
}

impl ScriptedProbe {
    fn new(scripts: &[&[f64]]) -> Arc<Self> {
        Arc::new(Self {
            timestamps: Mutex::new(scripts.iter().map(|script| script.to_vec()).collect()),
        })
    }
}

#[async_trait]
impl MediaProbe for ScriptedProbe {
    async fn packet_timestamps(&self, path: &Path) -> MediaResult<Vec<f64>> {
        self.timestamps
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| MediaError::CommandFailure {
                command: format!("ffprobe {}", path.display()),
                status: Some(1),
                stderr: "script exhausted".into(),
            })
    }
}

fn config(max_retries: u32) -> AcquisitionConfig {
    AcquisitionConfig {
        max_retries,
        nominal_duration: 900.0,
        pts_tolerance: 2.0,
        backoff_base: Duration::from_millis(1),
        backoff_factor: 10,
    }
}

fn slot() -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339("2018-03-18T08:15:00+06:00").unwrap()
}

fn job(dir: &Path, force: bool) -> SegmentJob {
    SegmentJob {
        camera_id: "cam-a9f3".into(),
        start: slot(),
        tmp: dir.join("tmp").join("cam-a9f3-08-15-1.flv"),
        dst: dir.join("dst").join("cam-a9f3-08-15-1.flv"),
        force,
    }
}

async fn read(path: &PathBuf) -> String {
    String::from_utf8(tokio::fs::read(path).await.unwrap()).unwrap()
}

#[tokio::test]
async fn clean_segment_short_circuits_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(job.dst.parent().unwrap())
        .await
        .unwrap();
    let mut report = GapReport::new(slot());
    report.attempts = 1;
    report
        .save(&GapReport::sidecar_path(&job.dst))
        .await
        .unwrap();

    let fetcher = MockFetcher::new();
    let engine = SegmentAcquisition::new(fetcher.clone(), ScriptedProbe::new(&[]), config(2));
    let verdict = engine.process(&job).await.unwrap();
    assert_eq!(verdict, JobVerdict::Success);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn exhausted_attempts_fail_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(job.dst.parent().unwrap())
        .await
        .unwrap();
    let mut report = GapReport::new(slot());
    report.attempts = 2;
    report.duration_error = Some(12.0);
    report
        .save(&GapReport::sidecar_path(&job.dst))
        .await
        .unwrap();

    let fetcher = MockFetcher::new();
    let engine = SegmentAcquisition::new(fetcher.clone(), ScriptedProbe::new(&[]), config(2));
    let verdict = engine.process(&job).await.unwrap();
    assert_eq!(verdict, JobVerdict::Failed);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn first_clean_attempt_succeeds_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    let fetcher = MockFetcher::new();
    let engine = SegmentAcquisition::new(
        fetcher.clone(),
        ScriptedProbe::new(&[&[899.0, 899.5, 900.0]]),
        config(2),
    );
    let verdict = engine.process(&job).await.unwrap();
    assert_eq!(verdict, JobVerdict::Success);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(read(&job.dst).await, "attempt-1");

    let report = GapReport::load(&GapReport::sidecar_path(&job.dst))
        .await
        .unwrap();
    assert_eq!(report.attempts, 1);
    assert!(report.is_clean());
}

#[tokio::test]
async fn best_attempt_is_kept_across_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    let fetcher = MockFetcher::new();
    // Shortfalls of 5, 2 and 10 seconds: attempt 2 must win.
    let engine = SegmentAcquisition::new(
        fetcher.clone(),
        ScriptedProbe::new(&[&[895.0], &[898.0], &[890.0]]),
        config(3),
    );
    let verdict = engine.process(&job).await.unwrap();
    assert_eq!(verdict, JobVerdict::Failed);
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(read(&job.dst).await, "attempt-2");

    let report = GapReport::load(&GapReport::sidecar_path(&job.dst))
        .await
        .unwrap();
    assert_eq!(report.attempts, 3);
    assert_eq!(report.gap_length(900.0), 2.0);
}

#[tokio::test]
async fn attempts_resume_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    let sidecar = GapReport::sidecar_path(&job.dst);

    let fetcher = MockFetcher::new();
    let engine =
        SegmentAcquisition::new(fetcher.clone(), ScriptedProbe::new(&[&[895.0]]), config(1));
    assert_eq!(engine.process(&job).await.unwrap(), JobVerdict::Failed);
    assert_eq!(GapReport::load(&sidecar).await.unwrap().attempts, 1);

    // A later run with a raised limit continues counting from the sidecar.
    let fetcher = MockFetcher::new();
    let engine =
        SegmentAcquisition::new(fetcher.clone(), ScriptedProbe::new(&[&[900.0]]), config(2));
    assert_eq!(engine.process(&job).await.unwrap(), JobVerdict::Success);
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(GapReport::load(&sidecar).await.unwrap().attempts, 2);
}

#[tokio::test]
async fn force_resets_attempts_but_keeps_the_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    let sidecar = GapReport::sidecar_path(&job.dst);

    let fetcher = MockFetcher::new();
    let engine = SegmentAcquisition::new(
        fetcher.clone(),
        ScriptedProbe::new(&[&[897.0], &[897.0]]),
        config(2),
    );
    assert_eq!(engine.process(&job).await.unwrap(), JobVerdict::Failed);
    assert_eq!(read(&job.dst).await, "attempt-1");
    assert_eq!(GapReport::load(&sidecar).await.unwrap().attempts, 2);

    // Forced rerun gets a fresh attempt budget, but worse fetches must not
    // displace the kept copy or its metrics.
    let job = SegmentJob {
        force: true,
        ..job.clone()
    };
    let fetcher = MockFetcher::new();
    let engine = SegmentAcquisition::new(
        fetcher.clone(),
        ScriptedProbe::new(&[&[895.0], &[896.0]]),
        config(2),
    );
    assert_eq!(engine.process(&job).await.unwrap(), JobVerdict::Failed);
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(read(&job.dst).await, "attempt-1");

    let report = GapReport::load(&sidecar).await.unwrap();
    assert_eq!(report.attempts, 2);
    assert_eq!(report.gap_length(900.0), 3.0);
}

#[tokio::test]
async fn unreadable_sidecar_is_treated_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(job.dst.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(GapReport::sidecar_path(&job.dst), b"{broken")
        .await
        .unwrap();

    let fetcher = MockFetcher::new();
    let engine =
        SegmentAcquisition::new(fetcher.clone(), ScriptedProbe::new(&[&[900.0]]), config(2));
    assert_eq!(engine.process(&job).await.unwrap(), JobVerdict::Success);
    assert_eq!(fetcher.calls(), 1);
    let report = GapReport::load(&GapReport::sidecar_path(&job.dst))
        .await
        .unwrap();
    assert_eq!(report.attempts, 1);
}

#[tokio::test]
async fn file_without_timestamps_is_invalid_and_charged_in_full() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    let fetcher = MockFetcher::new();
    let engine = SegmentAcquisition::new(fetcher, ScriptedProbe::new(&[&[]]), config(1));
    assert_eq!(engine.process(&job).await.unwrap(), JobVerdict::Failed);

    let report = GapReport::load(&GapReport::sidecar_path(&job.dst))
        .await
        .unwrap();
    assert!(report.invalid_file);
    assert_eq!(report.gap_length(900.0), 900.0);
}

#[tokio::test]
async fn analysis_records_gaps_and_shortfall() {
    let dir = tempfile::tempdir().unwrap();
    let engine = SegmentAcquisition::new(
        MockFetcher::new(),
        ScriptedProbe::new(&[&[0.0, 1.0, 5.0, 7.0, 880.0]]),
        config(1),
    );
    let report = engine
        .analyze(&dir.path().join("probe-target.flv"), slot())
        .await
        .unwrap();
    // Spacings of 4.0 and 873.0 exceed the 2 s tolerance.
    assert_eq!(report.gaps.len(), 2);
    assert_eq!(report.gaps[0].start, 1);
    assert_eq!(report.gaps[0].len, 4.0);
    assert_eq!(report.gaps[1].start, 7);
    assert_eq!(report.duration_error, Some(20.0));
    assert!(!report.invalid_file);
}

#[tokio::test]
async fn probe_breakage_surfaces_as_an_error_not_a_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    let engine = SegmentAcquisition::new(MockFetcher::new(), ScriptedProbe::new(&[]), config(1));
    assert!(engine.process(&job).await.is_err());
}
