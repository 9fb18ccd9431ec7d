//! reqwest-backed client for the SPB backend.
//!
//! One client instance is shared by the token manager, the auth facade and
//! the sync engine. Clone is cheap - reqwest::Client uses Arc internally
//! for connection pooling.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::Submission;

use super::{ApiError, AuthRemote, DeliveryRemote, RemoteSpbStatus, TokenGrant};

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    identity: &'a str,
    secret: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest<'a> {
    current_secret: &'a str,
    new_secret: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    subject_id: String,
    subject_name: String,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionRequest<'a> {
    latitude: Option<f64>,
    longitude: Option<f64>,
    actor_id: &'a str,
    actor_name: &'a str,
    reason: Option<&'a str>,
    recorded_at: DateTime<Utc>,
}

impl<'a> SubmissionRequest<'a> {
    fn from_submission(submission: &'a Submission) -> Self {
        Self {
            latitude: submission.latitude,
            longitude: submission.longitude,
            actor_id: &submission.actor_id,
            actor_name: &submission.actor_name,
            reason: submission.reason.as_deref(),
            recorded_at: submission.recorded_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpbRecordResponse {
    status: Option<String>,
    #[serde(default)]
    exception_reported: bool,
}

/// API client for the SPB backend.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a client with the given base URL and request timeout.
    /// The timeout covers connect, send and receive for every call.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ApiError::from_transport)?;

        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Check if a response is successful, translating everything else into
    /// the error taxonomy. A 429 carries the server's Retry-After hint.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
        } else {
            None
        };

        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body, retry_after))
    }

    async fn token_request<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<TokenGrant, ApiError> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        let response = Self::check_response(response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        Ok(TokenGrant {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            subject_id: token.subject_id,
            subject_name: token.subject_name,
            expires_at: token.expires_at,
        })
    }

    async fn put_submission(
        &self,
        path: String,
        access_token: &str,
        submission: &Submission,
    ) -> Result<(), ApiError> {
        debug!(business_key = %submission.business_key, kind = submission.kind.as_str(), "submitting");

        let response = self
            .client
            .put(&path)
            .bearer_auth(access_token)
            .json(&SubmissionRequest::from_submission(submission))
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        Self::check_response(response).await?;
        Ok(())
    }
}

impl AuthRemote for ApiClient {
    async fn login(&self, identity: &str, secret: &str) -> Result<TokenGrant, ApiError> {
        debug!(identity, "logging in");
        self.token_request("/auth/login", &LoginRequest { identity, secret })
            .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ApiError> {
        self.token_request("/auth/refresh", &RefreshRequest { refresh_token })
            .await
    }

    async fn validate(&self, access_token: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .get(self.url("/auth/validate"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        Self::check_response(response).await?;
        Ok(())
    }

    async fn change_password(
        &self,
        access_token: &str,
        current_secret: &str,
        new_secret: &str,
    ) -> Result<(), ApiError> {
        let response = self
            .client
            .post(self.url("/auth/change-password"))
            .bearer_auth(access_token)
            .json(&ChangePasswordRequest { current_secret, new_secret })
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        Self::check_response(response).await?;
        Ok(())
    }
}

impl DeliveryRemote for ApiClient {
    async fn submit_acceptance(
        &self,
        access_token: &str,
        submission: &Submission,
    ) -> Result<(), ApiError> {
        let path = self.url(&format!("/spb/{}/accept", submission.business_key));
        self.put_submission(path, access_token, submission).await
    }

    async fn submit_exception(
        &self,
        access_token: &str,
        submission: &Submission,
    ) -> Result<(), ApiError> {
        let path = self.url(&format!("/spb/{}/exception", submission.business_key));
        self.put_submission(path, access_token, submission).await
    }

    async fn fetch_status(
        &self,
        access_token: &str,
        business_key: &str,
    ) -> Result<RemoteSpbStatus, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/spb/{}", business_key)))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(ApiError::from_transport)?;

        // An unknown delivery note is simply unprocessed, not an error:
        // records can be queued before the server has the SPB at all.
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteSpbStatus::default());
        }

        let response = Self::check_response(response).await?;
        let record: SpbRecordResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;

        let accepted = matches!(record.status.as_deref(), Some("accepted") | Some("completed"));
        Ok(RemoteSpbStatus {
            accepted,
            exception_reported: record.exception_reported,
        })
    }
}
