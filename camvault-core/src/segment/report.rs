use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tokio::fs;

use super::{SegmentError, SegmentResult};

/// One detected discontinuity inside a segment's recorded content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapSpan {
    /// Presentation second the gap starts at.
    pub start: i64,
    /// Missing duration in seconds.
    pub len: f64,
}

/// Quality/retry-history record persisted next to its segment file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapReport {
    /// Slot start in the camera's local offset.
    pub localtime: DateTime<FixedOffset>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub invalid_file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_error: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gaps: Vec<GapSpan>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl GapReport {
    pub fn new(localtime: DateTime<FixedOffset>) -> Self {
        Self {
            localtime,
            attempts: 0,
            invalid_file: false,
            duration_error: None,
            gaps: Vec::new(),
        }
    }

    /// Total missing seconds. An invalid file counts as one full nominal
    /// duration; otherwise the duration shortfall plus every gap.
    pub fn gap_length(&self, nominal_duration: f64) -> f64 {
        if self.invalid_file {
            return nominal_duration;
        }
        self.duration_error.unwrap_or(0.0) + self.gaps.iter().map(|gap| gap.len).sum::<f64>()
    }

    pub fn is_clean(&self) -> bool {
        !self.invalid_file && self.duration_error.is_none() && self.gaps.is_empty()
    }

    /// Sidecar path co-located with the segment file.
    pub fn sidecar_path(segment: &Path) -> PathBuf {
        PathBuf::from(format!("{}.gapreport.json", segment.display()))
    }

    pub async fn load(path: &Path) -> SegmentResult<Self> {
        let bytes = fs::read(path).await.map_err(|source| SegmentError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        serde_json::from_slice(&bytes).map_err(|source| SegmentError::MalformedReport {
            source,
            path: path.to_path_buf(),
        })
    }

    pub async fn save(&self, path: &Path) -> SegmentResult<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| {
            SegmentError::MalformedReport {
                source,
                path: path.to_path_buf(),
            }
        })?;
        fs::write(path, bytes)
            .await
            .map_err(|source| SegmentError::Io {
                source,
                path: path.to_path_buf(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339("2018-03-18T08:15:00+06:00").unwrap()
    }

    #[test]
    fn clean_report_has_zero_gap_length() {
        let report = GapReport::new(slot());
        assert!(report.is_clean());
        assert_eq!(report.gap_length(900.0), 0.0);
    }

    #[test]
    fn gap_length_is_zero_iff_clean() {
        let mut invalid = GapReport::new(slot());
        invalid.invalid_file = true;
        assert!(!invalid.is_clean());
        assert_eq!(invalid.gap_length(900.0), 900.0);

        let mut short = GapReport::new(slot());
        short.duration_error = Some(30.5);
        assert!(!short.is_clean());
        assert_eq!(short.gap_length(900.0), 30.5);

        let mut gappy = GapReport::new(slot());
        gappy.gaps.push(GapSpan {
            start: 120,
            len: 4.0,
        });
        gappy.gaps.push(GapSpan {
            start: 600,
            len: 6.5,
        });
        assert!(!gappy.is_clean());
        assert_eq!(gappy.gap_length(900.0), 10.5);
    }

    #[test]
    fn sidecar_sits_next_to_segment() {
        let path = GapReport::sidecar_path(Path::new("/data/66/a9f3-08-15-3.flv"));
        assert_eq!(
            path,
            PathBuf::from("/data/66/a9f3-08-15-3.flv.gapreport.json")
        );
    }

    #[tokio::test]
    async fn report_roundtrips_through_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment.flv.gapreport.json");
        let mut report = GapReport::new(slot());
        report.attempts = 2;
        report.gaps.push(GapSpan {
            start: 10,
            len: 3.25,
        });
        report.save(&path).await.unwrap();
        let loaded = GapReport::load(&path).await.unwrap();
        assert_eq!(loaded, report);
    }

    #[tokio::test]
    async fn malformed_sidecar_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, b"{not json").await.unwrap();
        let err = GapReport::load(&path).await.unwrap_err();
        assert!(matches!(err, SegmentError::MalformedReport { .. }));
    }
}
