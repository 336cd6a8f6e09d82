use serde_json::Value;
use thiserror::Error;

/// Every failure the session engine reports to its callers.
///
/// `Clone` so a single renewal outcome can be handed to every caller
/// waiting on the same in-flight renewal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    CredentialsRejected(String),

    #[error("Validation failed: {message}")]
    ValidationFailed {
        message: String,
        details: Option<Value>,
    },

    #[error("No refresh token available - session lost")]
    NoRefreshToken,

    #[error("Token renewal rejected: {0}")]
    RenewalRejected(String),

    #[error("Session expired - please sign in again")]
    SessionLost,

    #[error("Request failed ({status}): {message}")]
    RequestFailed { status: u16, message: String },

    #[error("Network error: {0}")]
    TransportFailure(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    /// A bug in the engine itself, such as a panicked renewal task.
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = AuthError> = std::result::Result<T, E>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl AuthError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Pull the server's `error` message out of a JSON body, falling back
    /// to the (truncated) raw body.
    pub fn server_message(body: &str) -> String {
        serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| Self::truncate_body(body))
    }

    /// Map a non-success response from a data endpoint.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        AuthError::RequestFailed {
            status: status.as_u16(),
            message: Self::server_message(body),
        }
    }

    /// True for failures that mean the local session is gone.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            AuthError::SessionLost | AuthError::NoRefreshToken | AuthError::RenewalRejected(_)
        )
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        AuthError::TransportFailure(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::InvalidResponse(err.to_string())
    }
}
