//! Data model for queued delivery-note submissions.

pub mod record;

pub use record::{RecordStatus, Submission, SubmissionKind, SyncableRecord};
