//! Authentication: credential vault, token lifecycle, session tracking,
//! and the facade the UI layer drives.
//!
//! Ownership is strict: [`TokenManager`] alone decides credential validity,
//! [`SessionTracker`] alone tracks activity state (advisory - it never logs
//! anyone out), and [`AuthManager`] composes both and is the only place a
//! logout is triggered.

pub mod manager;
pub mod session;
pub mod token;
pub mod vault;

use thiserror::Error;

pub use manager::{AuthManager, AuthState};
pub use session::{SessionState, SessionTracker};
pub use token::{AccessTokens, Credential, TokenManager, TokenState};
pub use vault::{
    CredentialVault, IdentitySnapshot, KeyringVault, MemoryVault, OfflineCredentialRecord,
    VaultError,
};

use crate::api::ApiError;

/// Authentication failures, translated from transport and storage errors
/// so the UI layer never sees either raw.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("session cleared while waiting for refresh")]
    SessionCleared,

    #[error("no refresh token available")]
    NoRefreshToken,

    #[error("operation requires connectivity")]
    Offline,

    #[error("no offline credentials stored for '{0}'")]
    NoOfflineRecord(String),

    #[error("rate limited (retry after {retry_after_secs:?} seconds)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("network failure: {0}")]
    Network(String),

    #[error("credential storage failure: {0}")]
    Vault(String),
}

impl AuthError {
    /// Whether a retry with backoff may succeed. Rate limiting is
    /// retryable after the server-supplied delay.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::Network(_) | AuthError::RateLimited { .. } | AuthError::Offline
        )
    }

    /// A definitive rejection of the credentials or account, never caused
    /// by connectivity.
    pub fn is_definitive(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials | AuthError::Rejected(_) | AuthError::NoRefreshToken
        )
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => AuthError::InvalidCredentials,
            ApiError::AccessDenied(msg)
            | ApiError::Validation(msg)
            | ApiError::Conflict(msg)
            | ApiError::NotFound(msg) => AuthError::Rejected(msg),
            ApiError::RateLimited { retry_after_secs } => {
                AuthError::RateLimited { retry_after_secs }
            }
            ApiError::Timeout => AuthError::Network("request timed out".to_string()),
            ApiError::Network(msg) => AuthError::Network(msg),
            ApiError::ServerError(msg) => AuthError::Network(format!("server error: {msg}")),
            ApiError::InvalidResponse(msg) => {
                AuthError::Network(format!("invalid response: {msg}"))
            }
        }
    }
}

impl From<VaultError> for AuthError {
    fn from(err: VaultError) -> Self {
        AuthError::Vault(err.to_string())
    }
}
