//! Arrival-time status policy.
//!
//! The live pipeline only ever assigns `present` or `late`. `absent` exists
//! for the batch job that closes out a meeting and marks the no-shows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("policy store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Absent => "absent",
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-class thresholds, in minutes after the scheduled start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttendancePolicy {
    pub grace_period_minutes: f64,
    pub late_threshold_minutes: f64,
}

impl Default for AttendancePolicy {
    fn default() -> Self {
        Self { grace_period_minutes: 10.0, late_threshold_minutes: 15.0 }
    }
}

impl AttendancePolicy {
    /// Status for an arrival `minutes_late` after the start (negative when early).
    pub fn evaluate(&self, minutes_late: f64) -> AttendanceStatus {
        if minutes_late <= self.grace_period_minutes {
            AttendanceStatus::Present
        } else {
            // Past the late threshold is still late, never absent.
            AttendanceStatus::Late
        }
    }
}

pub fn minutes_late(scheduled_start: DateTime<Utc>, arrived: DateTime<Utc>) -> f64 {
    (arrived - scheduled_start).num_milliseconds() as f64 / 60_000.0
}

/// Status for one arrival. Without a policy or a scheduled start there is
/// nothing to be late for, so the arrival counts as present.
pub fn resolve_status(
    policy: Option<&AttendancePolicy>,
    scheduled_start: Option<DateTime<Utc>>,
    arrived: DateTime<Utc>,
) -> AttendanceStatus {
    match (policy, scheduled_start) {
        (Some(policy), Some(start)) => policy.evaluate(minutes_late(start, arrived)),
        _ => AttendanceStatus::Present,
    }
}

/// Read-only store of per-class policies.
pub trait PolicySource: Send + Sync {
    fn policy_for(&self, class_id: &str) -> Result<Option<AttendancePolicy>, PolicyError>;
}

impl PolicySource for HashMap<String, AttendancePolicy> {
    fn policy_for(&self, class_id: &str) -> Result<Option<AttendancePolicy>, PolicyError> {
        Ok(self.get(class_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn policy(grace: f64, late: f64) -> AttendancePolicy {
        AttendancePolicy { grace_period_minutes: grace, late_threshold_minutes: late }
    }

    #[test]
    fn test_boundaries() {
        let p = policy(10.0, 20.0);
        assert_eq!(p.evaluate(10.0), AttendanceStatus::Present);
        assert_eq!(p.evaluate(10.01), AttendanceStatus::Late);
        assert_eq!(p.evaluate(20.0), AttendanceStatus::Late);
        assert_eq!(p.evaluate(25.0), AttendanceStatus::Late);
        assert_eq!(p.evaluate(-5.0), AttendanceStatus::Present);
    }

    #[test]
    fn test_default_policy() {
        let p = AttendancePolicy::default();
        assert_eq!(p.grace_period_minutes, 10.0);
        assert_eq!(p.late_threshold_minutes, 15.0);
    }

    #[test]
    fn test_minutes_late() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        assert_eq!(minutes_late(start, start + Duration::seconds(90)), 1.5);
        assert_eq!(minutes_late(start, start - Duration::minutes(3)), -3.0);
    }

    #[test]
    fn test_resolve_status() {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let p = policy(10.0, 20.0);
        let at = |m: i64| start + Duration::minutes(m);
        assert_eq!(resolve_status(Some(&p), Some(start), at(4)), AttendanceStatus::Present);
        assert_eq!(resolve_status(Some(&p), Some(start), at(12)), AttendanceStatus::Late);
        assert_eq!(resolve_status(Some(&p), Some(start), at(90)), AttendanceStatus::Late);
        assert_eq!(resolve_status(None, Some(start), at(90)), AttendanceStatus::Present);
        assert_eq!(resolve_status(Some(&p), None, at(90)), AttendanceStatus::Present);
    }

    #[test]
    fn test_policy_map_source() {
        let mut map = HashMap::new();
        map.insert("CSCI321".to_string(), policy(5.0, 10.0));
        assert_eq!(map.policy_for("CSCI321").unwrap(), Some(policy(5.0, 10.0)));
        assert_eq!(map.policy_for("MATH101").unwrap(), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AttendanceStatus::Late).unwrap(), "\"late\"");
        assert_eq!(AttendanceStatus::Present.to_string(), "present");
    }
}
