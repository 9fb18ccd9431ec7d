//! Core library for the SPB field app.
//!
//! This crate contains everything below the UI for a field-operations
//! client that keeps working with intermittent connectivity:
//!
//! - `api`: HTTP client for the auth and delivery-note endpoints, plus the
//!   remote trait seams the engines are written against
//! - `auth`: credential vault, token lifecycle (single-flight refresh),
//!   session activity tracking, and the auth facade the UI calls
//! - `store`: the durable SQLite-backed submission queue
//! - `sync`: the background engine that drains queued submissions
//! - `net`: connectivity signal fan-out
//!
//! The UI layer constructs these components, subscribes to their `watch`
//! observables, and invokes the facade operations. Nothing in here renders
//! anything or installs a tracing subscriber.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod net;
pub mod store;
pub mod sync;

pub use api::{ApiClient, ApiError, AuthRemote, DeliveryRemote, RemoteSpbStatus, TokenGrant};
pub use auth::{
    AccessTokens, AuthError, AuthManager, AuthState, Credential, CredentialVault, KeyringVault,
    MemoryVault, SessionState, SessionTracker, TokenManager, TokenState, VaultError,
};
pub use config::Config;
pub use models::{RecordStatus, Submission, SubmissionKind, SyncableRecord};
pub use net::ConnectivityMonitor;
pub use store::{QueueStore, StoreError};
pub use sync::{DrainOutcome, SyncEngine, SyncStatus};
