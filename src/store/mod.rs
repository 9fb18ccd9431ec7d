//! Local durable storage for queued submissions.

pub mod queue;

pub use queue::{QueueCounts, QueueStore, StoreError};
