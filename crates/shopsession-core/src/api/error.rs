use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No access credential - log in first")]
    NoAccessCredential,

    #[error("No refresh credential - session is already logged out")]
    NoRefreshCredential,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(#[from] RefreshFailure),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Credential storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// Why a coordinated refresh did not produce a new access credential.
///
/// Every caller waiting on the same refresh receives a clone of this value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("refresh credential rejected with status {0}")]
    Rejected(u16),

    #[error("refresh endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("malformed refresh response: {0}")]
    Malformed(String),

    #[error("refresh timed out after {0:?}")]
    TimedOut(Duration),

    /// The session was logged out or replaced while the refresh was in
    /// flight. Its result is discarded and nothing is retried with it.
    #[error("session ended during refresh")]
    SessionEnded,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        ApiError::Status {
            status: status.as_u16(),
            body: Self::truncate_body(body),
        }
    }

    /// True when the error means the session is gone and the user must log in again.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            ApiError::NoAccessCredential | ApiError::NoRefreshCredential | ApiError::RefreshFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_short() {
        assert_eq!(ApiError::truncate_body("bad request"), "bad request");
    }

    #[test]
    fn test_truncate_body_long() {
        let body = "x".repeat(600);
        let truncated = ApiError::truncate_body(&body);
        assert!(truncated.starts_with(&"x".repeat(500)));
        assert!(truncated.ends_with("(truncated, 600 total bytes)"));
    }

    #[test]
    fn test_truncate_body_respects_char_boundaries() {
        let body = "é".repeat(400);
        let truncated = ApiError::truncate_body(&body);
        assert!(truncated.contains("truncated, 800 total bytes"));
    }

    #[test]
    fn test_session_lost_classification() {
        assert!(ApiError::NoAccessCredential.is_session_lost());
        assert!(ApiError::NoRefreshCredential.is_session_lost());
        assert!(ApiError::RefreshFailed(RefreshFailure::Rejected(400)).is_session_lost());
        assert!(!ApiError::InvalidResponse("x".into()).is_session_lost());
        assert!(!ApiError::from_status(reqwest::StatusCode::NOT_FOUND, "").is_session_lost());
    }

    #[test]
    fn test_refresh_failure_display() {
        assert_eq!(
            ApiError::from(RefreshFailure::Rejected(400)).to_string(),
            "Token refresh failed: refresh credential rejected with status 400"
        );
    }
}
