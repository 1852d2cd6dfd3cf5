use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::FixedOffset;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("failed to read camera directory {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("failed to parse camera directory {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
}

pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    pub region_number: u32,
    pub unit_number: u32,
    pub camera_ids: Vec<String>,
    pub timezone_offset_minutes: i32,
}

#[derive(Debug, Clone)]
pub struct UnitCameras {
    /// Sorted; camera index in the filesystem layout is the 1-based
    /// position in this list.
    pub camera_ids: Vec<String>,
    pub timezone_offset_minutes: i32,
}

impl UnitCameras {
    pub fn timezone(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.timezone_offset_minutes * 60)
    }
}

/// Read-only region → unit → camera lookup backing plan resolution.
#[derive(Debug, Clone, Default)]
pub struct CameraDirectory {
    regions: HashMap<u32, BTreeMap<u32, UnitCameras>>,
}

impl CameraDirectory {
    pub fn load(path: impl AsRef<Path>) -> DirectoryResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read(path).map_err(|source| DirectoryError::Io {
            source,
            path: path.to_path_buf(),
        })?;
        let entries: Vec<DirectoryEntry> =
            serde_json::from_slice(&content).map_err(|source| DirectoryError::Parse {
                source,
                path: path.to_path_buf(),
            })?;
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: Vec<DirectoryEntry>) -> Self {
        let mut regions: HashMap<u32, BTreeMap<u32, UnitCameras>> = HashMap::new();
        for entry in entries {
            let mut camera_ids = entry.camera_ids;
            camera_ids.sort();
            regions.entry(entry.region_number).or_default().insert(
                entry.unit_number,
                UnitCameras {
                    camera_ids,
                    timezone_offset_minutes: entry.timezone_offset_minutes,
                },
            );
        }
        Self { regions }
    }

    pub fn region(&self, region: u32) -> Option<&BTreeMap<u32, UnitCameras>> {
        self.regions.get(&region)
    }

    pub fn contains_region(&self, region: u32) -> bool {
        self.regions.contains_key(&region)
    }

    /// Units of `region` within `[first, last]`, sorted by unit number.
    pub fn units_in_range(
        &self,
        region: u32,
        first: u32,
        last: u32,
    ) -> Vec<(u32, &UnitCameras)> {
        self.region(region)
            .map(|units| {
                units
                    .range(first..=last)
                    .map(|(unit, cameras)| (*unit, cameras))
                    .collect()
            })
            .unwrap_or_default()
    }
}
