use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use crate::sqlite::configure_connection;

use super::models::{NewPlan, PlanRecord, Routine};
use super::{PlanError, PlanResult};

const PLAN_SCHEMA: &str = include_str!("../../../sql/plans.sql");

#[derive(Debug, Clone)]
pub struct SqlitePlanStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqlitePlanStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqlitePlanStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> PlanResult<SqlitePlanStore> {
        let path = self.path.ok_or(PlanError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqlitePlanStore { path, flags })
    }
}

/// Durable plan registry keyed by integer id.
#[derive(Debug, Clone)]
pub struct SqlitePlanStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqlitePlanStore {
    pub fn builder() -> SqlitePlanStoreBuilder {
        SqlitePlanStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> PlanResult<Self> {
        SqlitePlanStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> PlanResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            PlanError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| PlanError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> PlanResult<()> {
        let conn = self.open()?;
        conn.execute_batch(PLAN_SCHEMA)?;
        Ok(())
    }

    /// Insert a plan, returning the record with its assigned id.
    pub fn insert(&self, plan: &NewPlan) -> PlanResult<PlanRecord> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO plans (routine, region, first_unit, last_unit, hour_start, hour_end, finished)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                plan.routine.as_str(),
                plan.region,
                plan.first_unit,
                plan.last_unit,
                plan.hour_start,
                plan.hour_end,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.fetch_with(&conn, id)?
            .ok_or(PlanError::NotFound { plan_id: id })
    }

    pub fn fetch(&self, id: i64) -> PlanResult<Option<PlanRecord>> {
        let conn = self.open()?;
        self.fetch_with(&conn, id)
    }

    fn fetch_with(&self, conn: &Connection, id: i64) -> PlanResult<Option<PlanRecord>> {
        let mut stmt = conn.prepare("SELECT * FROM plans WHERE id = ?1")?;
        let record = stmt
            .query_row([id], |row| PlanRecord::from_row(row))
            .optional()?;
        Ok(record)
    }

    pub fn list(&self) -> PlanResult<Vec<PlanRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM plans ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| PlanRecord::from_row(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_unfinished(&self, routine: Option<Routine>) -> PlanResult<Vec<PlanRecord>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM plans
             WHERE finished = 0 AND (?1 IS NULL OR routine = ?1)
             ORDER BY id",
        )?;
        let rows = stmt
            .query_map([routine.as_ref().map(Routine::as_str)], |row| {
                PlanRecord::from_row(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete(&self, id: i64) -> PlanResult<()> {
        let conn = self.open()?;
        let affected = conn.execute("DELETE FROM plans WHERE id = ?1", [id])?;
        if affected == 0 {
            return Err(PlanError::NotFound { plan_id: id });
        }
        Ok(())
    }

    pub fn set_finished(&self, id: i64, finished: bool) -> PlanResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE plans SET finished = ?1, updated_at = CURRENT_TIMESTAMP WHERE id = ?2",
            params![if finished { 1 } else { 0 }, id],
        )?;
        if affected == 0 {
            return Err(PlanError::NotFound { plan_id: id });
        }
        Ok(())
    }
}
