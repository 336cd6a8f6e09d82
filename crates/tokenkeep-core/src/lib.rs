//! tokenkeep - client-side session management for token-authenticated APIs.
//!
//! Keeps an access/refresh token pair alive on behalf of a UI layer:
//! persists it, renews it ahead of expiry, renews it again when the server
//! rejects it, and signs the user out when renewal is no longer possible.
//!
//! The usual wiring is:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokenkeep_core::{ApiClient, Config, RefreshScheduler, ReqwestTransport, SessionManager};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let transport = ReqwestTransport::new(&config.api_url, config.request_timeout())?;
//! let manager = SessionManager::new(
//!     ApiClient::new(Arc::new(transport)),
//!     config.credential_store()?,
//!     RefreshScheduler::new(config.renewal),
//! );
//! manager.restore();
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiClient, ApiRequest, ApiResponse, AuthError, ReqwestTransport, Result, Transport};
pub use auth::{
    decode_claims, AccessTokenClaims, AuthState, CredentialStore, RefreshScheduler, RenewalPolicy,
    Session, SessionManager, UserInfo,
};
pub use config::{Config, StorageKind};
