use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use camvault_core::media::{
    ConcatPart, Concatenator, FrameHasher, FrameHashes, FrameRecord, MediaError, MediaResult,
};
use camvault_core::{GapReport, GapSpan, JobVerdict, MergeConfig, MergeEngine, MergeError, MergeJob};
use chrono::{DateTime, FixedOffset};

/// Hashes keyed by file name; unknown files report no frames.
struct MapHasher {
    by_name: HashMap<String, FrameHashes>,
}

impl MapHasher {
    fn new(entries: Vec<(&str, Vec<(i64, &str)>)>) -> Arc<Self> {
        let by_name = entries
            .into_iter()
            .map(|(name, frames)| {
                (
                    name.to_string(),
                    FrameHashes {
                        timebase_num: 1,
                        timebase_den: 1000,
                        frames: frames
                            .into_iter()
                            .map(|(pts, hash)| FrameRecord {
                                pts,
                                hash: hash.to_string(),
                            })
                            .collect(),
                    },
                )
            })
            .collect();
        Arc::new(Self { by_name })
    }

    fn empty() -> Arc<Self> {
        Arc::new(Self {
            by_name: HashMap::new(),
        })
    }
}

#[async_trait]
impl FrameHasher for MapHasher {
    async fn frame_hashes(&self, path: &Path) -> MediaResult<FrameHashes> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(self.by_name.get(&name).cloned().unwrap_or(FrameHashes {
            timebase_num: 1,
            timebase_den: 1000,
            frames: Vec::new(),
        }))
    }
}

/// Records every concat invocation and materializes the destination.
#[derive(Default)]
struct RecordingConcat {
    calls: Mutex<Vec<(Vec<ConcatPart>, PathBuf)>>,
}

impl RecordingConcat {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls(&self) -> Vec<(Vec<ConcatPart>, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Concatenator for RecordingConcat {
    async fn concat(&self, parts: &[ConcatPart], dest: &Path) -> MediaResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((parts.to_vec(), dest.to_path_buf()));
        tokio::fs::write(dest, b"merged")
            .await
            .map_err(|source| MediaError::Io {
                source,
                path: dest.to_path_buf(),
            })
    }
}

fn slot_time(hour: u8, minute: u8) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(&format!("2018-03-18T{hour:02}:{minute:02}:00+06:00")).unwrap()
}

fn all_slots() -> Vec<(u8, u8)> {
    (8u8..20)
        .flat_map(|hour| [0u8, 15, 30, 45].map(|minute| (hour, minute)))
        .collect()
}

async fn write_clean_report(dir: &Path, hour: u8, minute: u8, attempts: u32) {
    let segment = dir.join(format!("cam-{hour:02}-{minute:02}-1.flv"));
    let mut report = GapReport::new(slot_time(hour, minute));
    report.attempts = attempts;
    report.save(&GapReport::sidecar_path(&segment)).await.unwrap();
}

fn job(base: &Path, force: bool) -> MergeJob {
    MergeJob {
        srcdir: base.join("src"),
        tmp: base.join("tmp/out.mp4"),
        dst: base.join("dst/out.mp4"),
        force,
    }
}

fn engine(
    hasher: Arc<MapHasher>,
    concat: Arc<RecordingConcat>,
    config: MergeConfig,
) -> MergeEngine {
    MergeEngine::new(hasher, concat, config)
}

#[tokio::test]
async fn three_missing_slots_blow_a_1000s_budget() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(&job.srcdir).await.unwrap();

    // 45 of the 48 expected slots are present and clean.
    for (hour, minute) in all_slots().into_iter().skip(3) {
        write_clean_report(&job.srcdir, hour, minute, 2).await;
    }

    let concat = RecordingConcat::new();
    let config = MergeConfig {
        gap_tolerance: 1000.0,
        ..MergeConfig::default()
    };
    let engine = engine(MapHasher::empty(), concat.clone(), config);
    let verdict = engine.merge_camera_dir(&job).await.unwrap();

    // 3 x 900 = 2700 missing seconds > 1000.
    assert_eq!(verdict, JobVerdict::Failed);
    assert!(concat.calls().is_empty());
    assert!(!job.dst.exists());
}

#[tokio::test]
async fn in_budget_gaps_still_merge() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(&job.srcdir).await.unwrap();

    for (hour, minute) in all_slots() {
        write_clean_report(&job.srcdir, hour, minute, 2).await;
    }
    // One slot re-written with a small, fully-retried gap.
    let segment = job.srcdir.join("cam-12-30-1.flv");
    let mut report = GapReport::new(slot_time(12, 30));
    report.attempts = 2;
    report.gaps.push(GapSpan {
        start: 300,
        len: 45.0,
    });
    report.save(&GapReport::sidecar_path(&segment)).await.unwrap();

    tokio::fs::write(job.srcdir.join("cam-12-30-1.flv"), b"x")
        .await
        .unwrap();
    tokio::fs::write(job.srcdir.join("cam-12-45-1.flv"), b"y")
        .await
        .unwrap();

    let concat = RecordingConcat::new();
    let engine = engine(MapHasher::empty(), concat.clone(), MergeConfig::default());
    let verdict = engine.merge_camera_dir(&job).await.unwrap();

    assert_eq!(verdict, JobVerdict::Success);
    assert!(job.dst.is_file());
    assert!(!job.tmp.exists());
    let calls = concat.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0.len(), 2);
}

#[tokio::test]
async fn unfinished_slots_refuse_unless_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(&job.srcdir).await.unwrap();

    for (hour, minute) in all_slots().into_iter().skip(1) {
        write_clean_report(&job.srcdir, hour, minute, 2).await;
    }
    // The 08:00 slot still has gaps and one retry left.
    let segment = job.srcdir.join("cam-08-00-1.flv");
    let mut report = GapReport::new(slot_time(8, 0));
    report.attempts = 1;
    report.gaps.push(GapSpan {
        start: 10,
        len: 20.0,
    });
    report.save(&GapReport::sidecar_path(&segment)).await.unwrap();
    tokio::fs::write(&segment, b"x").await.unwrap();

    let concat = RecordingConcat::new();
    let engine = engine(MapHasher::empty(), concat.clone(), MergeConfig::default());
    assert_eq!(
        engine.merge_camera_dir(&job).await.unwrap(),
        JobVerdict::Failed
    );
    assert!(concat.calls().is_empty());

    let tolerant = MergeConfig {
        tolerate_incomplete: true,
        ..MergeConfig::default()
    };
    let engine = MergeEngine::new(MapHasher::empty(), concat.clone(), tolerant);
    assert_eq!(
        engine.merge_camera_dir(&job).await.unwrap(),
        JobVerdict::Success
    );
    assert_eq!(concat.calls().len(), 1);
}

#[tokio::test]
async fn existing_destination_skips_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(job.dst.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&job.dst, b"already merged").await.unwrap();

    let concat = RecordingConcat::new();
    let engine = engine(MapHasher::empty(), concat.clone(), MergeConfig::default());
    assert_eq!(
        engine.merge_camera_dir(&job).await.unwrap(),
        JobVerdict::Skipped
    );
    assert!(concat.calls().is_empty());
    let kept = tokio::fs::read(&job.dst).await.unwrap();
    assert_eq!(kept, b"already merged");
}

#[tokio::test]
async fn overlap_is_trimmed_at_the_latest_matching_frame() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(&job.srcdir).await.unwrap();
    tokio::fs::write(job.srcdir.join("cam-08-00-1.flv"), b"first")
        .await
        .unwrap();
    tokio::fs::write(job.srcdir.join("cam-08-15-1.flv"), b"second")
        .await
        .unwrap();

    // The second file starts with a frame that also appears (twice) inside
    // the first; the cut lands on the most recent occurrence.
    let hasher = MapHasher::new(vec![
        (
            "cam-08-00-1.flv",
            vec![(0, "aa"), (200, "bb"), (400, "dup"), (600, "cc"), (800, "dup")],
        ),
        (
            "cam-08-15-1.flv",
            vec![(0, "dup"), (200, "dd"), (400, "ee")],
        ),
    ]);

    let concat = RecordingConcat::new();
    let config = MergeConfig {
        // Only the reports matter for the budget; keep it permissive here.
        gap_tolerance: 1.0e9,
        ..MergeConfig::default()
    };
    let engine = engine(hasher, concat.clone(), config);
    assert_eq!(
        engine.merge_camera_dir(&job).await.unwrap(),
        JobVerdict::Success
    );

    let calls = concat.calls();
    assert_eq!(calls.len(), 1);
    let parts = &calls[0].0;
    assert_eq!(parts.len(), 2);
    assert!(parts[0].path.ends_with("cam-08-00-1.flv"));
    assert_eq!(parts[0].outpoint, Some(0.8));
    assert!(parts[1].path.ends_with("cam-08-15-1.flv"));
    assert_eq!(parts[1].outpoint, None);
}

#[tokio::test]
async fn disjoint_files_concatenate_untrimmed() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(&job.srcdir).await.unwrap();
    tokio::fs::write(job.srcdir.join("cam-08-00-1.flv"), b"first")
        .await
        .unwrap();
    tokio::fs::write(job.srcdir.join("cam-08-15-1.flv"), b"second")
        .await
        .unwrap();

    let hasher = MapHasher::new(vec![
        ("cam-08-00-1.flv", vec![(0, "aa"), (200, "bb")]),
        ("cam-08-15-1.flv", vec![(0, "cc"), (200, "dd")]),
    ]);
    let concat = RecordingConcat::new();
    let config = MergeConfig {
        gap_tolerance: 1.0e9,
        ..MergeConfig::default()
    };
    let engine = engine(hasher, concat.clone(), config);
    assert_eq!(
        engine.merge_camera_dir(&job).await.unwrap(),
        JobVerdict::Success
    );
    let calls = concat.calls();
    assert!(calls[0].0.iter().all(|part| part.outpoint.is_none()));
}

#[tokio::test]
async fn empty_camera_directory_is_an_error_when_budget_allows() {
    let dir = tempfile::tempdir().unwrap();
    let job = job(dir.path(), false);
    tokio::fs::create_dir_all(&job.srcdir).await.unwrap();

    let concat = RecordingConcat::new();
    let config = MergeConfig {
        gap_tolerance: 1.0e9,
        ..MergeConfig::default()
    };
    let engine = engine(MapHasher::empty(), concat.clone(), config);
    let err = engine.merge_camera_dir(&job).await.unwrap_err();
    assert!(matches!(err, MergeError::NoSegments { .. }));
}
