use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::PlanError;

/// Kind of processing a plan requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Routine {
    Download,
    Merge,
    Export,
}

impl Routine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Routine::Download => "download",
            Routine::Merge => "merge",
            Routine::Export => "export",
        }
    }
}

impl fmt::Display for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Routine {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Routine::Download),
            "merge" => Ok(Routine::Merge),
            "export" => Ok(Routine::Export),
            other => Err(PlanError::InvalidRoutine(other.to_string())),
        }
    }
}

/// Persisted half of a plan: everything the durable registry stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: i64,
    pub routine: Routine,
    pub region: u32,
    pub first_unit: u32,
    pub last_unit: u32,
    pub hour_start: u8,
    pub hour_end: u8,
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl PlanRecord {
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_at: Option<NaiveDateTime> = row.get("created_at")?;
        let updated_at: Option<NaiveDateTime> = row.get("updated_at")?;
        Ok(Self {
            id: row.get("id")?,
            routine: row
                .get::<_, String>("routine")?
                .parse()
                .unwrap_or(Routine::Download),
            region: row.get::<_, i64>("region")? as u32,
            first_unit: row.get::<_, i64>("first_unit")? as u32,
            last_unit: row.get::<_, i64>("last_unit")? as u32,
            hour_start: row.get::<_, i64>("hour_start")? as u8,
            hour_end: row.get::<_, i64>("hour_end")? as u8,
            finished: row.get::<_, i64>("finished")? != 0,
            created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
            updated_at: updated_at.map(|dt| Utc.from_utc_datetime(&dt)),
        })
    }
}

/// Request to create a plan; the registry assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPlan {
    pub routine: Routine,
    pub region: u32,
    pub first_unit: u32,
    pub last_unit: u32,
    pub hour_start: u8,
    pub hour_end: u8,
}

/// In-memory-only plan state; never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanRuntime {
    /// A supervising watcher currently owns this plan.
    pub active: bool,
    /// Operator restart: engines reset their attempt counters.
    pub force_restart: bool,
}

/// A plan as the supervisor works with it: the persisted record tagged
/// with its transient runtime flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub record: PlanRecord,
    pub runtime: PlanRuntime,
}

impl Plan {
    pub fn queued(record: PlanRecord) -> Self {
        Self {
            record,
            runtime: PlanRuntime::default(),
        }
    }

    pub fn restarted(record: PlanRecord) -> Self {
        Self {
            record,
            runtime: PlanRuntime {
                active: false,
                force_restart: true,
            },
        }
    }

    pub fn id(&self) -> i64 {
        self.record.id
    }

    /// Stalled: no longer active but never finished; eligible for manual
    /// restart.
    pub fn is_stalled(&self) -> bool {
        !self.runtime.active && !self.record.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_roundtrips_through_str() {
        for routine in [Routine::Download, Routine::Merge, Routine::Export] {
            assert_eq!(routine.as_str().parse::<Routine>().unwrap(), routine);
        }
        assert!("playout".parse::<Routine>().is_err());
    }

    #[test]
    fn fresh_plan_is_neither_active_nor_finished() {
        let plan = Plan::queued(PlanRecord {
            id: 1,
            routine: Routine::Download,
            region: 66,
            first_unit: 1,
            last_unit: 10,
            hour_start: 8,
            hour_end: 20,
            finished: false,
            created_at: None,
            updated_at: None,
        });
        assert!(!plan.runtime.active);
        assert!(!plan.runtime.force_restart);
        assert!(plan.is_stalled());
    }
}
