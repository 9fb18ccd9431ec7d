//! Queued submission records and their status machine.
//!
//! A [`SyncableRecord`] is created the moment a courier performs an action
//! (accepting a delivery note or reporting a problem with it) and lives in
//! the local queue until the server has acknowledged it. Records are kept
//! after syncing for audit and idempotence checks; only an explicit
//! retention sweep would remove them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which remote endpoint a submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    /// Courier accepted the delivery note.
    Acceptance,
    /// Courier reported a problem ("kendala") with the delivery note.
    ExceptionReport,
}

impl SubmissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionKind::Acceptance => "acceptance",
            SubmissionKind::ExceptionReport => "exception_report",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "acceptance" => Some(SubmissionKind::Acceptance),
            "exception_report" => Some(SubmissionKind::ExceptionReport),
            _ => None,
        }
    }
}

/// The payload sent to the server for one courier action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    /// Delivery-note number, e.g. "SPB-100". The server keys on this.
    pub business_key: String,
    pub kind: SubmissionKind,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Identity of the courier performing the action.
    pub actor_id: String,
    pub actor_name: String,
    /// Free-text reason, required by the server for exception reports.
    pub reason: Option<String>,
    /// When the action happened in the field, not when it reached the server.
    pub recorded_at: DateTime<Utc>,
}

/// Queue status of a record. Transitions are owned exclusively by the
/// sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Waiting for its first submission attempt.
    Pending,
    /// A drain pass is currently submitting it.
    Syncing,
    /// Acknowledged by the server.
    Synced,
    /// Failed with a retryable error; still inside the retry budget.
    FailedRetryable,
    /// Out of retries or definitively rejected; needs manual intervention.
    FailedPermanent,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Syncing => "syncing",
            RecordStatus::Synced => "synced",
            RecordStatus::FailedRetryable => "failed_retryable",
            RecordStatus::FailedPermanent => "failed_permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RecordStatus::Pending),
            "syncing" => Some(RecordStatus::Syncing),
            "synced" => Some(RecordStatus::Synced),
            "failed_retryable" => Some(RecordStatus::FailedRetryable),
            "failed_permanent" => Some(RecordStatus::FailedPermanent),
            _ => None,
        }
    }

    /// Whether an automatic drain should pick this record up.
    pub fn is_drainable(&self) -> bool {
        matches!(self, RecordStatus::Pending | RecordStatus::FailedRetryable)
    }
}

/// A durably queued submission plus its sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord {
    pub id: i64,
    pub business_key: String,
    pub kind: SubmissionKind,
    pub payload: Submission,
    pub status: RecordStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            RecordStatus::Pending,
            RecordStatus::Syncing,
            RecordStatus::Synced,
            RecordStatus::FailedRetryable,
            RecordStatus::FailedPermanent,
        ] {
            assert_eq!(RecordStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RecordStatus::parse("bogus"), None);
    }

    #[test]
    fn test_drainable_statuses() {
        assert!(RecordStatus::Pending.is_drainable());
        assert!(RecordStatus::FailedRetryable.is_drainable());
        assert!(!RecordStatus::Syncing.is_drainable());
        assert!(!RecordStatus::Synced.is_drainable());
        assert!(!RecordStatus::FailedPermanent.is_drainable());
    }

    #[test]
    fn test_kind_round_trip() {
        assert_eq!(
            SubmissionKind::parse(SubmissionKind::Acceptance.as_str()),
            Some(SubmissionKind::Acceptance)
        );
        assert_eq!(
            SubmissionKind::parse(SubmissionKind::ExceptionReport.as_str()),
            Some(SubmissionKind::ExceptionReport)
        );
        assert_eq!(SubmissionKind::parse(""), None);
    }
}
