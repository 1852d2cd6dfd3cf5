use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CamvaultConfig {
    pub paths: PathsSection,
    pub workers: WorkersSection,
    pub download: DownloadSection,
    pub merge: MergeSection,
    pub media: MediaSection,
    #[serde(default)]
    pub pool: PoolSection,
    pub capture: CaptureSection,
}

impl CamvaultConfig {
    /// Resolve a possibly-relative path against `paths.base_dir`.
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.max_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "download.max_retries".into(),
                detail: "must be greater than zero".into(),
            });
        }
        if self.merge.window_start_hour >= self.merge.window_end_hour {
            return Err(ConfigError::Invalid {
                field: "merge.window_start_hour".into(),
                detail: "business window must start before it ends".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub downloaded_dir: String,
    pub tmp_download_dir: String,
    pub merged_dir: String,
    pub tmp_merge_dir: String,
    pub tasks_dir: String,
    pub plans_db: String,
    pub directory_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkersSection {
    #[serde(default = "WorkersSection::default_download")]
    pub download: usize,
    #[serde(default = "WorkersSection::default_merge")]
    pub merge: usize,
    #[serde(default = "WorkersSection::default_export")]
    pub export: usize,
}

impl WorkersSection {
    fn default_download() -> usize {
        1000
    }

    fn default_merge() -> usize {
        2
    }

    fn default_export() -> usize {
        1
    }
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            download: Self::default_download(),
            merge: Self::default_merge(),
            export: Self::default_export(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadSection {
    #[serde(default = "DownloadSection::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "DownloadSection::default_segment_duration")]
    pub segment_duration_s: f64,
    #[serde(default = "DownloadSection::default_pts_tolerance")]
    pub pts_tolerance_s: f64,
    #[serde(default = "DownloadSection::default_backoff_base")]
    pub backoff_base_s: u64,
    #[serde(default = "DownloadSection::default_backoff_factor")]
    pub backoff_factor: u32,
    /// External fetch command template; `{camera}`, `{start}` and `{dest}`
    /// are substituted per segment.
    pub fetch_command: String,
    #[serde(default)]
    pub force: bool,
}

impl DownloadSection {
    fn default_max_retries() -> u32 {
        2
    }

    fn default_segment_duration() -> f64 {
        900.0
    }

    fn default_pts_tolerance() -> f64 {
        2.0
    }

    fn default_backoff_base() -> u64 {
        1
    }

    fn default_backoff_factor() -> u32 {
        10
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeSection {
    #[serde(default = "MergeSection::default_window_start")]
    pub window_start_hour: u8,
    #[serde(default = "MergeSection::default_window_end")]
    pub window_end_hour: u8,
    #[serde(default = "MergeSection::default_gap_tolerance")]
    pub gap_tolerance_s: f64,
    #[serde(default)]
    pub tolerate_incomplete: bool,
    #[serde(default)]
    pub force: bool,
}

impl MergeSection {
    fn default_window_start() -> u8 {
        8
    }

    fn default_window_end() -> u8 {
        20
    }

    fn default_gap_tolerance() -> f64 {
        120.0
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaSection {
    #[serde(default = "MediaSection::default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "MediaSection::default_ffprobe")]
    pub ffprobe: String,
    #[serde(default = "MediaSection::default_segment_ext")]
    pub segment_ext: String,
    #[serde(default = "MediaSection::default_merged_ext")]
    pub merged_ext: String,
}

impl MediaSection {
    fn default_ffmpeg() -> String {
        "ffmpeg".into()
    }

    fn default_ffprobe() -> String {
        "ffprobe".into()
    }

    fn default_segment_ext() -> String {
        "flv".into()
    }

    fn default_merged_ext() -> String {
        "mp4".into()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    /// Per-job grace period on close, in milliseconds. Zero means no wait.
    #[serde(default)]
    pub grace_timeout_ms: u64,
    /// Retained handle window; zero keeps every handle.
    #[serde(default)]
    pub handle_window: usize,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            grace_timeout_ms: 0,
            handle_window: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureSection {
    /// Calendar day the cameras recorded; segment slot times are this date
    /// in each unit's local offset.
    pub date: NaiveDate,
}

pub fn load_camvault_config<P: AsRef<Path>>(path: P) -> Result<CamvaultConfig> {
    let config: CamvaultConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
