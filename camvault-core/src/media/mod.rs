//! Seams for the external media operations.
//!
//! Fetching, probing, frame hashing and concatenation are delegated to
//! external processes; the engines only see these traits, which keeps the
//! orchestration logic testable without ffmpeg on the path.

mod framemd5;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use regex::Regex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error};

pub use framemd5::{parse_framemd5, FrameHashes, FrameRecord};

pub type MediaResult<T> = std::result::Result<T, MediaError>;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("io error on {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("command `{command}` failed with status {status:?}: {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: Duration,
    },
    #[error("unparseable {kind} output: {detail}")]
    Parse {
        kind: &'static str,
        detail: String,
    },
}

/// Fetches one fixed-duration segment into a local file.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch(
        &self,
        camera_id: &str,
        start: DateTime<FixedOffset>,
        dest: &Path,
    ) -> MediaResult<()>;
}

/// Extracts presentation timestamps of a file's video packets.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn packet_timestamps(&self, path: &Path) -> MediaResult<Vec<f64>>;
}

/// Extracts per-frame content fingerprints.
#[async_trait]
pub trait FrameHasher: Send + Sync {
    async fn frame_hashes(&self, path: &Path) -> MediaResult<FrameHashes>;
}

/// One input of a concatenation, optionally trimmed at `outpoint` seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ConcatPart {
    pub path: PathBuf,
    pub outpoint: Option<f64>,
}

/// Stream-copies a list of parts into one continuous file.
#[async_trait]
pub trait Concatenator: Send + Sync {
    async fn concat(&self, parts: &[ConcatPart], dest: &Path) -> MediaResult<()>;
}

/// ffmpeg/ffprobe-backed implementation of the probe, hash and concat
/// seams plus the configurable fetch command.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
    probe_timeout: Duration,
    hash_timeout: Duration,
}

impl FfmpegToolkit {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            probe_timeout: Duration::from_secs(60),
            hash_timeout: Duration::from_secs(300),
        }
    }

    pub fn probe_timeout(mut self, value: Duration) -> Self {
        self.probe_timeout = value;
        self
    }

    pub fn hash_timeout(mut self, value: Duration) -> Self {
        self.hash_timeout = value;
        self
    }

    async fn run_bounded(
        &self,
        command: &mut Command,
        label: String,
        bound: Duration,
    ) -> MediaResult<Vec<u8>> {
        command.kill_on_drop(true);
        let result = timeout(bound, command.output()).await;
        match result {
            Ok(Ok(output)) if output.status.success() => Ok(output.stdout),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                error!(command = %label, status = ?output.status.code(), "external command failed");
                Err(MediaError::CommandFailure {
                    command: label,
                    status: output.status.code(),
                    stderr,
                })
            }
            Ok(Err(source)) => Err(MediaError::Io {
                source,
                path: PathBuf::from(&label),
            }),
            Err(_) => Err(MediaError::Timeout {
                command: label,
                timeout: bound,
            }),
        }
    }
}

#[async_trait]
impl MediaProbe for FfmpegToolkit {
    async fn packet_timestamps(&self, path: &Path) -> MediaResult<Vec<f64>> {
        let mut command = Command::new(&self.ffprobe);
        command
            .arg("-loglevel")
            .arg("error")
            .arg("-hide_banner")
            .arg("-of")
            .arg("compact")
            .arg("-select_streams")
            .arg("v:0")
            .arg("-show_entries")
            .arg("packet=pts_time")
            .arg(path);
        let label = format!("{} {}", self.ffprobe.display(), path.display());
        let stdout = self
            .run_bounded(&mut command, label, self.probe_timeout)
            .await?;

        let text = String::from_utf8_lossy(&stdout);
        let pattern = Regex::new(r"packet\|pts_time=(\d+(?:\.\d+)?)").unwrap();
        let mut timestamps = Vec::new();
        for line in text.lines() {
            if let Some(captures) = pattern.captures(line) {
                let value = captures[1].parse::<f64>().map_err(|_| MediaError::Parse {
                    kind: "ffprobe",
                    detail: format!("bad pts_time in line: {line}"),
                })?;
                timestamps.push(value);
            }
        }
        Ok(timestamps)
    }
}

#[async_trait]
impl FrameHasher for FfmpegToolkit {
    async fn frame_hashes(&self, path: &Path) -> MediaResult<FrameHashes> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-nostats")
            .arg("-hide_banner")
            .arg("-i")
            .arg(path)
            .arg("-an")
            .arg("-f")
            .arg("framemd5")
            .arg("-c")
            .arg("copy")
            .arg("-");
        let label = format!("{} framemd5 {}", self.ffmpeg.display(), path.display());
        let stdout = self
            .run_bounded(&mut command, label, self.hash_timeout)
            .await?;
        parse_framemd5(&String::from_utf8_lossy(&stdout))
    }
}

#[async_trait]
impl Concatenator for FfmpegToolkit {
    async fn concat(&self, parts: &[ConcatPart], dest: &Path) -> MediaResult<()> {
        let mut list = String::new();
        for part in parts {
            list.push_str(&format!("file '{}'\n", part.path.display()));
            if let Some(outpoint) = part.outpoint {
                list.push_str(&format!("outpoint {outpoint}\n"));
            }
        }

        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-nostats")
            .arg("-hide_banner")
            .arg("-avoid_negative_ts")
            .arg("make_zero")
            .arg("-fflags")
            .arg("+genpts")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-protocol_whitelist")
            .arg("file,pipe")
            .arg("-i")
            .arg("-")
            .arg("-c")
            .arg("copy")
            .arg("-flags")
            .arg("+global_header")
            .arg("-movflags")
            .arg("+faststart")
            .arg("-y")
            .arg(dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let label = format!("{} concat {}", self.ffmpeg.display(), dest.display());
        debug!(command = %label, parts = parts.len(), "concatenating segments");
        let mut child = command.spawn().map_err(|source| MediaError::Io {
            source,
            path: self.ffmpeg.clone(),
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(list.as_bytes())
                .await
                .map_err(|source| MediaError::Io {
                    source,
                    path: dest.to_path_buf(),
                })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| MediaError::Io {
                source,
                path: dest.to_path_buf(),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            error!(command = %label, status = ?output.status.code(), "concat failed");
            return Err(MediaError::CommandFailure {
                command: label,
                status: output.status.code(),
                stderr,
            });
        }
        Ok(())
    }
}

/// Runs the operator-configured fetch command per segment. The template's
/// `{camera}`, `{start}` and `{dest}` placeholders are substituted; the
/// start time is handed over in UTC.
#[derive(Debug, Clone)]
pub struct CommandSegmentFetcher {
    template: String,
}

impl CommandSegmentFetcher {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    fn render(&self, camera_id: &str, start: DateTime<FixedOffset>, dest: &Path) -> String {
        let utc = start.with_timezone(&Utc);
        self.template
            .replace("{camera}", camera_id)
            .replace("{start}", &utc.to_rfc3339())
            .replace("{dest}", &dest.display().to_string())
    }
}

#[async_trait]
impl SegmentFetcher for CommandSegmentFetcher {
    async fn fetch(
        &self,
        camera_id: &str,
        start: DateTime<FixedOffset>,
        dest: &Path,
    ) -> MediaResult<()> {
        let command = self.render(camera_id, start, dest);
        run_shell(&command, None).await.map(|_| ())
    }
}

/// Run a shell command line, returning its stdout. Non-zero exit becomes a
/// structured `CommandFailure` with captured stderr.
pub async fn run_shell(command_line: &str, stdin: Option<&[u8]>) -> MediaResult<Vec<u8>> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(command_line)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    }

    let mut child = command.spawn().map_err(|source| MediaError::Io {
        source,
        path: PathBuf::from("sh"),
    })?;
    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(bytes)
            .await
            .map_err(|source| MediaError::Io {
                source,
                path: PathBuf::from("sh"),
            })?;
    }
    let output = child
        .wait_with_output()
        .await
        .map_err(|source| MediaError::Io {
            source,
            path: PathBuf::from("sh"),
        })?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        error!(command = %command_line, status = ?output.status.code(), "shell command failed");
        Err(MediaError::CommandFailure {
            command: command_line.to_string(),
            status: output.status.code(),
            stderr,
        })
    }
}
