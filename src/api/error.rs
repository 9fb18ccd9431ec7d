use thiserror::Error;

/// Errors from the SPB backend, classified so callers never have to look
/// at raw transport errors or status codes.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unauthorized - token rejected by server")]
    Unauthorized,

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("rejected by server: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited (retry after {retry_after_secs:?} seconds)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("server error: {0}")]
    ServerError(String),

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            format!(
                "{}... (truncated, {} total bytes)",
                &body[..MAX_ERROR_BODY_LENGTH],
                body.len()
            )
        }
    }

    pub fn from_status(
        status: reqwest::StatusCode,
        body: &str,
        retry_after_secs: Option<u64>,
    ) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            409 => ApiError::Conflict(truncated),
            429 => ApiError::RateLimited { retry_after_secs },
            400..=499 => ApiError::Validation(truncated),
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Classify a transport-level failure. Timeouts are always retryable
    /// and never a definitive rejection.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(err.to_string())
        }
    }

    /// Whether a retry with backoff may succeed. A 401 is retryable from a
    /// queued record's point of view: the credential is the problem, not
    /// the record, and the next drain runs with a refreshed token.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Timeout
                | ApiError::Network(_)
                | ApiError::ServerError(_)
                | ApiError::RateLimited { .. }
                | ApiError::Unauthorized
        )
    }

    /// Whether this is a definitive auth rejection, as opposed to the
    /// network being unable to answer the question.
    pub fn is_definitive_auth(&self) -> bool {
        matches!(self, ApiError::Unauthorized | ApiError::AccessDenied(_))
    }

    /// Transport-level failure (connectivity or timeout), where the request
    /// may never have reached the server.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Timeout | ApiError::Network(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, "", None),
            ApiError::Unauthorized
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::CONFLICT, "already accepted", None),
            ApiError::Conflict(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "reason required", None),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "", Some(7)),
            ApiError::RateLimited { retry_after_secs: Some(7) }
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "", None),
            ApiError::ServerError(_)
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(ApiError::Timeout.is_retryable());
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(ApiError::ServerError("500".into()).is_retryable());
        assert!(ApiError::RateLimited { retry_after_secs: None }.is_retryable());
        assert!(ApiError::Unauthorized.is_retryable());

        assert!(!ApiError::Validation("bad".into()).is_retryable());
        assert!(!ApiError::Conflict("dup".into()).is_retryable());
        assert!(!ApiError::NotFound("gone".into()).is_retryable());
    }

    #[test]
    fn test_definitive_auth() {
        assert!(ApiError::Unauthorized.is_definitive_auth());
        assert!(ApiError::AccessDenied("disabled".into()).is_definitive_auth());
        assert!(!ApiError::Timeout.is_definitive_auth());
        assert!(!ApiError::ServerError("boom".into()).is_definitive_auth());
    }

    #[test]
    fn test_body_truncation() {
        let long = "x".repeat(2_000);
        let err = ApiError::from_status(reqwest::StatusCode::FORBIDDEN, &long, None);
        let msg = err.to_string();
        assert!(msg.len() < 700);
        assert!(msg.contains("truncated"));
    }
}
