//! The live class meeting and its confirmed attendees.

use crate::policy::AttendanceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Describes the class meeting being scanned. Supplied by the caller when
/// scanning starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    /// Module or course the meeting belongs to. Keys the policy lookup.
    pub class_id: String,
    pub timetable_slot_id: Option<String>,
    pub room: Option<String>,
    pub lecturer: Option<String>,
    /// Expected roster size.
    pub expected_count: Option<usize>,
    pub scheduled_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEntry {
    pub identity_id: String,
    pub display_name: String,
    /// Smoothed similarity at confirmation time.
    pub confidence: f32,
    pub liveness: f32,
    pub recorded_at: DateTime<Utc>,
    /// Filled in once the status policy has run.
    pub status: Option<AttendanceStatus>,
    /// Whether the attendance sink accepted the record.
    pub persisted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttendanceSessionState {
    pub session_id: Option<Uuid>,
    pub metadata: SessionMetadata,
    pub started_at: Option<DateTime<Utc>>,
    pub entries: Vec<AttendanceEntry>,
    pub active: bool,
}

impl AttendanceSessionState {
    pub fn contains(&self, identity_id: &str) -> bool {
        self.entries.iter().any(|e| e.identity_id == identity_id)
    }
}

/// The meeting an attendee was admitted to.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub session_id: Uuid,
    pub metadata: SessionMetadata,
}

/// Mutex-guarded session. Every read hands out a copy.
#[derive(Default)]
pub struct AttendanceSession {
    state: Mutex<AttendanceSessionState>,
}

impl AttendanceSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AttendanceSessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a new meeting, discarding whatever was there.
    pub fn start(&self, metadata: SessionMetadata) -> Uuid {
        let id = Uuid::new_v4();
        *self.lock() = AttendanceSessionState {
            session_id: Some(id),
            metadata,
            started_at: Some(Utc::now()),
            entries: Vec::new(),
            active: true,
        };
        id
    }

    /// Record an attendee now. See [`AttendanceSession::add_at`].
    pub fn add(&self, identity_id: &str, display_name: &str, confidence: f32, liveness: f32) -> bool {
        self.add_at(identity_id, display_name, confidence, liveness, Utc::now()).is_some()
    }

    /// Record an attendee. Returns `None` without touching the state when
    /// the identity is already present or no meeting is active; otherwise
    /// the meeting the entry joined, read under the same lock.
    pub fn add_at(
        &self,
        identity_id: &str,
        display_name: &str,
        confidence: f32,
        liveness: f32,
        at: DateTime<Utc>,
    ) -> Option<Admission> {
        let mut state = self.lock();
        if !state.active || state.contains(identity_id) {
            return None;
        }
        let session_id = state.session_id?;
        state.entries.push(AttendanceEntry {
            identity_id: identity_id.to_string(),
            display_name: display_name.to_string(),
            confidence,
            liveness,
            recorded_at: at,
            status: None,
            persisted: false,
        });
        Some(Admission { session_id, metadata: state.metadata.clone() })
    }

    /// Attach the evaluated status and sink result to an entry. Does nothing
    /// once `session_id` is no longer the current meeting.
    pub fn mark_recorded(&self, session_id: Uuid, identity_id: &str, status: AttendanceStatus, persisted: bool) {
        let mut state = self.lock();
        if state.session_id != Some(session_id) {
            return;
        }
        if let Some(entry) = state.entries.iter_mut().find(|e| e.identity_id == identity_id) {
            entry.status = Some(status);
            entry.persisted = persisted;
        }
    }

    pub fn snapshot(&self) -> AttendanceSessionState {
        self.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// End the meeting: returns its final state and leaves an empty, inactive one.
    pub fn stop(&self) -> AttendanceSessionState {
        let mut state = self.lock();
        let mut last = std::mem::take(&mut *state);
        last.active = false;
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SessionMetadata {
        SessionMetadata {
            class_id: "CSCI321".into(),
            room: Some("B2.14".into()),
            expected_count: Some(40),
            ..Default::default()
        }
    }

    #[test]
    fn test_add_is_at_most_once() {
        let session = AttendanceSession::new();
        session.start(meta());
        assert!(session.add("S001", "Ada", 0.51, 0.8));
        assert!(!session.add("S001", "Ada", 0.90, 0.9));

        let snap = session.snapshot();
        assert_eq!(snap.entries.iter().filter(|e| e.identity_id == "S001").count(), 1);
        assert!((snap.entries[0].confidence - 0.51).abs() < 1e-6);
    }

    #[test]
    fn test_add_without_active_session() {
        let session = AttendanceSession::new();
        assert!(!session.add("S001", "Ada", 0.5, 0.5));
        assert!(session.snapshot().entries.is_empty());
    }

    #[test]
    fn test_start_resets_entries() {
        let session = AttendanceSession::new();
        let first = session.start(meta());
        session.add("S001", "Ada", 0.5, 0.5);
        let second = session.start(meta());
        assert_ne!(first, second);
        assert!(session.snapshot().entries.is_empty());
        assert!(session.add("S001", "Ada", 0.5, 0.5));
    }

    #[test]
    fn test_stop_returns_final_state_and_clears() {
        let session = AttendanceSession::new();
        session.start(meta());
        session.add("S001", "Ada", 0.5, 0.5);
        session.add("S002", "Bob", 0.6, 0.7);

        let last = session.stop();
        assert!(!last.active);
        assert_eq!(last.entries.len(), 2);
        assert_eq!(last.metadata.class_id, "CSCI321");

        let now = session.snapshot();
        assert!(!now.active);
        assert!(now.entries.is_empty());
        assert!(now.session_id.is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let session = AttendanceSession::new();
        session.start(meta());
        let before = session.snapshot();
        session.add("S001", "Ada", 0.5, 0.5);
        assert!(before.entries.is_empty());
        assert_eq!(session.snapshot().entries.len(), 1);
    }

    #[test]
    fn test_mark_recorded() {
        let session = AttendanceSession::new();
        let id = session.start(meta());
        session.add("S001", "Ada", 0.5, 0.5);
        session.mark_recorded(id, "S001", AttendanceStatus::Late, true);
        let entry = &session.snapshot().entries[0];
        assert_eq!(entry.status, Some(AttendanceStatus::Late));
        assert!(entry.persisted);
    }

    #[test]
    fn test_add_at_returns_admitting_meeting() {
        let session = AttendanceSession::new();
        let id = session.start(meta());
        let admission = session.add_at("S001", "Ada", 0.5, 0.5, Utc::now()).unwrap();
        assert_eq!(admission.session_id, id);
        assert_eq!(admission.metadata.class_id, "CSCI321");
        assert!(session.add_at("S001", "Ada", 0.5, 0.5, Utc::now()).is_none());
    }

    #[test]
    fn test_mark_recorded_ignores_replaced_meeting() {
        let session = AttendanceSession::new();
        let old = session.start(meta());
        session.add("S001", "Ada", 0.5, 0.5);
        session.start(SessionMetadata { class_id: "MATH101".into(), ..Default::default() });
        session.add("S001", "Ada", 0.5, 0.5);

        session.mark_recorded(old, "S001", AttendanceStatus::Late, true);
        let entry = &session.snapshot().entries[0];
        assert_eq!(entry.status, None);
        assert!(!entry.persisted);
    }

    #[test]
    fn test_concurrent_adds_keep_one_entry() {
        let session = std::sync::Arc::new(AttendanceSession::new());
        session.start(meta());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = std::sync::Arc::clone(&session);
                std::thread::spawn(move || s.add("S001", "Ada", 0.5, 0.5))
            })
            .collect();
        let wins = handles.into_iter().map(|h| h.join().unwrap()).filter(|&w| w).count();
        assert_eq!(wins, 1);
        assert_eq!(session.snapshot().entries.len(), 1);
    }

    #[test]
    fn test_metadata_deserializes_with_defaults() {
        let m: SessionMetadata =
            serde_json::from_str(r#"{"class_id":"CSCI321","scheduled_start":"2026-03-02T09:00:00Z"}"#).unwrap();
        assert_eq!(m.class_id, "CSCI321");
        assert!(m.room.is_none());
        assert!(m.scheduled_start.is_some());
    }
}
