use crate::policy::AttendanceStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("attendance sink unavailable: {0}")]
    Unavailable(String),
    #[error("attendance write failed: {0}")]
    Write(String),
}

/// One policy-evaluated attendance event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub identity_id: String,
    pub class_id: String,
    pub timetable_slot_id: Option<String>,
    pub status: AttendanceStatus,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// The store already held a row for this identity and slot.
    AlreadyRecorded,
}

/// Durable destination for attendance events. Called at most once per
/// identity per session.
pub trait AttendanceSink: Send + Sync {
    fn record(&self, record: &AttendanceRecord) -> Result<RecordOutcome, SinkError>;
}
