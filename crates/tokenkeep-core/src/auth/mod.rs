//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `CredentialStore`: persisted token pair and user snapshot, over a
//!   pluggable secret backend (OS keyring, file, or memory)
//! - `decode_claims`: unverified expiry lookup on access tokens
//! - `RefreshScheduler`: the single proactive renewal timer
//! - `SessionManager`: login, logout, renewal and authenticated calls
//!
//! Only `SessionManager` writes to the store.

pub mod claims;
pub mod credentials;
pub mod manager;
pub mod scheduler;
pub mod session;

pub use claims::{decode_claims, AccessTokenClaims, NEAR_EXPIRY_THRESHOLD_SECS};
pub use credentials::{CredentialStore, FileBackend, KeyringBackend, MemoryBackend, SecretBackend};
pub use manager::{AuthState, SessionManager};
pub use scheduler::{RefreshScheduler, RenewalPolicy};
pub use session::{Session, UserInfo};
