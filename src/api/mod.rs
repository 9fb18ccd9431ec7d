//! Remote interface for the SPB backend.
//!
//! The engines in this crate are written against the [`AuthRemote`] and
//! [`DeliveryRemote`] trait seams rather than a concrete HTTP client, so
//! they can be driven by in-memory fakes in tests. [`ApiClient`] is the
//! production reqwest implementation of both.

pub mod client;
pub mod error;

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::models::{Submission, SubmissionKind};

pub use client::ApiClient;
pub use error::ApiError;

/// A successful token issuance from the server, either from a login or a
/// refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub subject_id: String,
    pub subject_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Server-side processing state of a delivery note, used as the
/// idempotence guard before resubmitting a queued record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteSpbStatus {
    pub accepted: bool,
    pub exception_reported: bool,
}

impl RemoteSpbStatus {
    /// Whether the server has already processed a submission of this kind.
    pub fn covers(&self, kind: SubmissionKind) -> bool {
        match kind {
            SubmissionKind::Acceptance => self.accepted,
            SubmissionKind::ExceptionReport => self.exception_reported,
        }
    }
}

/// Authentication endpoints.
pub trait AuthRemote: Send + Sync + 'static {
    fn login(
        &self,
        identity: &str,
        secret: &str,
    ) -> impl Future<Output = Result<TokenGrant, ApiError>> + Send;

    fn refresh(
        &self,
        refresh_token: &str,
    ) -> impl Future<Output = Result<TokenGrant, ApiError>> + Send;

    /// Lightweight check that a token is still honored by the server.
    fn validate(&self, access_token: &str) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn change_password(
        &self,
        access_token: &str,
        current_secret: &str,
        new_secret: &str,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Delivery-note submission and read-back endpoints.
pub trait DeliveryRemote: Send + Sync + 'static {
    fn submit_acceptance(
        &self,
        access_token: &str,
        submission: &Submission,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn submit_exception(
        &self,
        access_token: &str,
        submission: &Submission,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Query the authoritative record state by delivery-note number.
    fn fetch_status(
        &self,
        access_token: &str,
        business_key: &str,
    ) -> impl Future<Output = Result<RemoteSpbStatus, ApiError>> + Send;
}
