//! SQLite persistence: the durable attendance log and per-class status policies.

use rollcall_core::policy::PolicyError;
use rollcall_core::{AttendancePolicy, AttendanceRecord, AttendanceSink, PolicySource, RecordOutcome, SinkError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id       TEXT NOT NULL,
    class_id          TEXT NOT NULL,
    timetable_slot_id TEXT,
    status            TEXT NOT NULL,
    confidence        REAL NOT NULL,
    recorded_at       TEXT NOT NULL,
    UNIQUE (identity_id, timetable_slot_id)
);
CREATE INDEX IF NOT EXISTS attendance_by_slot ON attendance (timetable_slot_id);

CREATE TABLE IF NOT EXISTS attendance_policies (
    class_id               TEXT PRIMARY KEY,
    grace_period_minutes   REAL,
    late_threshold_minutes REAL
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored attendance row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAttendance {
    pub identity_id: String,
    pub class_id: String,
    pub timetable_slot_id: Option<String>,
    pub status: String,
    pub confidence: f64,
    pub recorded_at: String,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "attendance database opened");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert one attendance row. A row for the same identity and slot
    /// already present is left untouched.
    pub fn insert_attendance(&self, record: &AttendanceRecord) -> Result<RecordOutcome, StoreError> {
        let inserted = self.conn().execute(
            "INSERT INTO attendance (
                identity_id, class_id, timetable_slot_id, status, confidence, recorded_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(identity_id, timetable_slot_id) DO NOTHING",
            params![
                record.identity_id,
                record.class_id,
                record.timetable_slot_id,
                record.status.as_str(),
                f64::from(record.confidence),
                record.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(if inserted == 0 { RecordOutcome::AlreadyRecorded } else { RecordOutcome::Inserted })
    }

    /// All rows for a timetable slot, oldest first.
    pub fn attendance_for_slot(&self, timetable_slot_id: &str) -> Result<Vec<StoredAttendance>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT identity_id, class_id, timetable_slot_id, status, confidence, recorded_at
             FROM attendance
             WHERE timetable_slot_id = ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![timetable_slot_id], |row| {
            Ok(StoredAttendance {
                identity_id: row.get(0)?,
                class_id: row.get(1)?,
                timetable_slot_id: row.get(2)?,
                status: row.get(3)?,
                confidence: row.get(4)?,
                recorded_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Create or replace the policy for a class.
    pub fn set_policy(&self, class_id: &str, policy: &AttendancePolicy) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO attendance_policies (class_id, grace_period_minutes, late_threshold_minutes)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(class_id) DO UPDATE SET
                grace_period_minutes = excluded.grace_period_minutes,
                late_threshold_minutes = excluded.late_threshold_minutes",
            params![class_id, policy.grace_period_minutes, policy.late_threshold_minutes],
        )?;
        Ok(())
    }

    /// Policy row for a class. NULL columns take the default values.
    pub fn policy(&self, class_id: &str) -> Result<Option<AttendancePolicy>, StoreError> {
        let row: Option<(Option<f64>, Option<f64>)> = self
            .conn()
            .query_row(
                "SELECT grace_period_minutes, late_threshold_minutes
                 FROM attendance_policies WHERE class_id = ?1",
                params![class_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(row.map(|(grace, late)| {
            let defaults = AttendancePolicy::default();
            AttendancePolicy {
                grace_period_minutes: grace.unwrap_or(defaults.grace_period_minutes),
                late_threshold_minutes: late.unwrap_or(defaults.late_threshold_minutes),
            }
        }))
    }
}

impl AttendanceSink for SqliteStore {
    fn record(&self, record: &AttendanceRecord) -> Result<RecordOutcome, SinkError> {
        self.insert_attendance(record).map_err(|e| SinkError::Write(e.to_string()))
    }
}

impl PolicySource for SqliteStore {
    fn policy_for(&self, class_id: &str) -> Result<Option<AttendancePolicy>, PolicyError> {
        self.policy(class_id).map_err(|e| PolicyError::Unavailable(e.to_string()))
    }
}
