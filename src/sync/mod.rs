//! Offline-first synchronization of queued submissions.

pub mod engine;
pub mod state;

pub use engine::SyncEngine;
pub use state::{DrainOutcome, SyncStatus};
