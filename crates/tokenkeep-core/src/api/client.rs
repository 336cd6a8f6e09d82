//! API client for the remote authentication service.
//!
//! This module provides the `ApiClient` struct, which speaks the
//! `/auth/*` endpoints and maps their failures onto [`AuthError`] kinds.
//! It holds no session state; the session manager decides which tokens
//! to present.

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::UserInfo;

use super::error::{AuthError, Result};
use super::transport::{ApiRequest, ApiResponse, Transport};

// ============================================================================
// Endpoints
// ============================================================================

const LOGIN_PATH: &str = "/auth/login";
const REGISTER_PATH: &str = "/auth/register";
const LOGOUT_PATH: &str = "/auth/logout";
const REFRESH_PATH: &str = "/auth/refresh";
const USERINFO_PATH: &str = "/auth/userinfo";

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Tokens and profile returned by a successful login.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub user_info: UserInfo,
}

/// A rotated token pair returned by the renewal endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    details: Option<Value>,
}

/// Client for the authentication endpoints.
/// Clone is cheap - the transport is shared behind an Arc.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send an arbitrary request as-is.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.transport.send(request).await
    }

    /// Exchange username and password for a token pair and user info.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse> {
        let request = ApiRequest::post(LOGIN_PATH, &LoginRequest { username, password })?;
        let response = self.send(request).await?;

        if !response.is_success() {
            let parsed = parse_error_body(&response.body);
            let message = parsed
                .error
                .unwrap_or_else(|| AuthError::server_message(&response.body));
            debug!(status = %response.status, "Login rejected");
            return Err(match parsed.details {
                Some(details) => AuthError::ValidationFailed {
                    message,
                    details: Some(details),
                },
                None => AuthError::CredentialsRejected(message),
            });
        }

        response.json()
    }

    /// Create an account. The body is passed through untouched.
    pub async fn register(&self, fields: &Value) -> Result<Value> {
        let request = ApiRequest::post(REGISTER_PATH, fields)?;
        let response = self.send(request).await?;

        if !response.is_success() {
            let parsed = parse_error_body(&response.body);
            return Err(AuthError::ValidationFailed {
                message: parsed
                    .error
                    .unwrap_or_else(|| "Registration failed".to_string()),
                details: parsed.details,
            });
        }

        response.json()
    }

    /// Tell the server to revoke `refresh_token`. The response body is
    /// ignored; only transport failures and non-2xx statuses are reported.
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        let request = ApiRequest::post(LOGOUT_PATH, &RefreshRequest { refresh_token })?;
        let response = self.send(request).await?;
        if !response.is_success() {
            warn!(status = %response.status, "Logout notification not acknowledged");
        }
        Ok(())
    }

    /// Exchange a refresh token for a new token pair.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let request = ApiRequest::post(REFRESH_PATH, &RefreshRequest { refresh_token })?;
        let response = self.send(request).await?;

        if !response.is_success() {
            let message = parse_error_body(&response.body)
                .error
                .unwrap_or_else(|| format!("status {}", response.status));
            return Err(AuthError::RenewalRejected(message));
        }

        response.json()
    }

    /// The request for the current user's profile; sent through the
    /// authenticated call wrapper so it picks up renewal.
    pub fn userinfo_request() -> ApiRequest {
        ApiRequest::get(USERINFO_PATH)
    }

    // ===== Generic helpers for unauthenticated endpoints =====

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(ApiRequest::get(path))
            .await?
            .error_for_status()?
            .json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        self.send(ApiRequest::post(path, body)?)
            .await?
            .error_for_status()?
            .json()
    }
}

fn parse_error_body(body: &str) -> ErrorBody {
    serde_json::from_str(body).unwrap_or(ErrorBody {
        error: None,
        details: None,
    })
}
