use std::path::PathBuf;

use chrono::{DateTime, FixedOffset};

use crate::config::CamvaultConfig;

/// Filesystem contract for segment and merge artifacts.
///
/// Plan-driven segments live under
/// `{downloaded_dir}/{region}/{unit}-c{index}-{camera}/` with file names
/// `{camera}-{HH}-{MM}-{plan}.{ext}` (hour and minute zero-padded so the
/// lexical order of a camera directory is chronological). Merged output is
/// one file per camera under `{merged_dir}/{region}/`. Individually
/// dispatched tasks use flat per-camera directories instead.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    downloaded_dir: PathBuf,
    tmp_download_dir: PathBuf,
    merged_dir: PathBuf,
    tmp_merge_dir: PathBuf,
    segment_ext: String,
    merged_ext: String,
}

impl StorageLayout {
    pub fn from_config(config: &CamvaultConfig) -> Self {
        Self {
            downloaded_dir: config.resolve_path(&config.paths.downloaded_dir),
            tmp_download_dir: config.resolve_path(&config.paths.tmp_download_dir),
            merged_dir: config.resolve_path(&config.paths.merged_dir),
            tmp_merge_dir: config.resolve_path(&config.paths.tmp_merge_dir),
            segment_ext: config.media.segment_ext.clone(),
            merged_ext: config.media.merged_ext.clone(),
        }
    }

    fn camera_stem(unit: u32, camera_index: usize, camera_id: &str) -> String {
        format!("{unit}-c{camera_index}-{camera_id}")
    }

    /// Working directory holding one camera's downloaded segments.
    pub fn camera_dir(
        &self,
        region: u32,
        unit: u32,
        camera_index: usize,
        camera_id: &str,
    ) -> PathBuf {
        self.downloaded_dir
            .join(region.to_string())
            .join(Self::camera_stem(unit, camera_index, camera_id))
    }

    /// Scratch directory for in-flight downloads of one camera.
    pub fn download_tmp_dir(&self, camera_id: &str) -> PathBuf {
        self.tmp_download_dir.join(camera_id)
    }

    pub fn segment_file_name(
        &self,
        camera_id: &str,
        hour: u8,
        minute: u8,
        plan_id: i64,
    ) -> String {
        format!(
            "{camera_id}-{hour:02}-{minute:02}-{plan_id}.{}",
            self.segment_ext
        )
    }

    /// Task-mode segment name, keyed by the slot's unix timestamp.
    pub fn task_segment_file_name(&self, camera_id: &str, start: DateTime<FixedOffset>) -> String {
        format!("{camera_id}-{}.{}", start.timestamp(), self.segment_ext)
    }

    pub fn merged_file(
        &self,
        region: u32,
        unit: u32,
        camera_index: usize,
        camera_id: &str,
    ) -> PathBuf {
        self.merged_dir.join(region.to_string()).join(format!(
            "{}.{}",
            Self::camera_stem(unit, camera_index, camera_id),
            self.merged_ext
        ))
    }

    pub fn merge_tmp_file(
        &self,
        region: u32,
        unit: u32,
        camera_index: usize,
        camera_id: &str,
    ) -> PathBuf {
        self.tmp_merge_dir.join(region.to_string()).join(format!(
            "{}.{}",
            Self::camera_stem(unit, camera_index, camera_id),
            self.merged_ext
        ))
    }

    /// Flat per-camera paths used by the resumable task mode.
    pub fn task_camera_dir(&self, camera_id: &str) -> PathBuf {
        self.downloaded_dir.join(camera_id)
    }

    pub fn task_merged_file(&self, camera_id: &str) -> PathBuf {
        self.merged_dir
            .join(camera_id)
            .join(format!("{camera_id}.{}", self.merged_ext))
    }

    pub fn task_merge_tmp_file(&self, camera_id: &str) -> PathBuf {
        self.tmp_merge_dir
            .join(camera_id)
            .join(format!("{camera_id}.{}", self.merged_ext))
    }

    pub fn segment_ext(&self) -> &str {
        &self.segment_ext
    }
}
