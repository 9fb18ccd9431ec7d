//! Observable synchronization state.

use chrono::{DateTime, Utc};

/// Snapshot of the queue published to the UI layer over a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncStatus {
    /// Records still waiting to reach the server (pending, in-flight, or
    /// awaiting retry).
    pub pending: u64,
    /// Records currently in flight.
    pub syncing: u64,
    /// Records parked for manual intervention.
    pub failed_permanent: u64,
    pub online: bool,
    pub last_drain_at: Option<DateTime<Utc>>,
}

/// Result of a single drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainOutcome {
    pub synced: usize,
    pub failed: usize,
}
