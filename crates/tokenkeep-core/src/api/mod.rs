//! REST API client module for the authentication service.
//!
//! This module provides the `ApiClient` for the `/auth/*` endpoints and
//! the `Transport` capability every outbound call goes through.
//!
//! Protected endpoints use JWT bearer token authentication; see
//! [`crate::auth::SessionManager::call_protected`].

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, LoginResponse, TokenPair};
pub use error::{AuthError, Result};
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport, REFRESH_HINT_HEADER};
