//! Durable key/value storage for the session.
//!
//! A [`SecretBackend`] knows how to get/set/remove a string by key;
//! [`CredentialStore`] owns the three persisted keys on top of any backend
//! and is the only code that reads or writes them. No expiry or validation
//! logic lives here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use keyring::Entry;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::api::AuthError;

use super::session::{Session, UserInfo};

/// Keychain service name for the keyring backend
pub const SERVICE_NAME: &str = "tokenkeep";

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const USER_INFO_KEY: &str = "user_info";

const ALL_KEYS: [&str; 3] = [ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY, USER_INFO_KEY];

/// Minimal persistence capability: string values by key.
pub trait SecretBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Apply several writes; `None` removes the key. Backends that can
    /// commit the batch in one step override this.
    fn set_many(&self, entries: &[(&str, Option<&str>)]) -> Result<()> {
        for (key, value) in entries {
            match value {
                Some(v) => self.set(key, v)?,
                None => self.remove(key)?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// Keyring backend
// ============================================================================

/// Stores each key as a separate entry in the OS keychain.
#[derive(Debug, Clone)]
pub struct KeyringBackend {
    service: String,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key).context("Failed to create keyring entry")
    }
}

impl Default for KeyringBackend {
    fn default() -> Self {
        Self::new(SERVICE_NAME)
    }
}

impl SecretBackend for KeyringBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).context("Failed to retrieve secret from keychain"),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .context("Failed to store secret in keychain")
    }

    fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).context("Failed to delete secret from keychain"),
        }
    }
}

// ============================================================================
// File backend
// ============================================================================

/// Stores all keys in one JSON file, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> Result<HashMap<String, String>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let contents =
            std::fs::read_to_string(&self.path).context("Failed to read credentials file")?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents).context("Failed to parse credentials file")
    }

    /// Write tmp + rename. The temp name is unique per write so concurrent
    /// saves never share a partially written file.
    fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        if map.is_empty() {
            if self.path.exists() {
                std::fs::remove_file(&self.path).context("Failed to remove credentials file")?;
            }
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(map)?;
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
        let tmp_name = format!(
            "{}.{}.{}.tmp",
            self.path.file_name().unwrap_or_default().to_string_lossy(),
            std::process::id(),
            seq,
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        std::fs::write(&tmp_path, contents).context("Failed to write credentials file")?;
        restrict_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &self.path).context("Failed to replace credentials file")?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

impl SecretBackend for FileBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_map()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, Some(value))])
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.set_many(&[(key, None)])
    }

    fn set_many(&self, entries: &[(&str, Option<&str>)]) -> Result<()> {
        let _guard = self.lock.lock();
        let mut map = self.read_map().unwrap_or_else(|e| {
            warn!(error = %e, "Discarding unreadable credentials file");
            HashMap::new()
        });
        for (key, value) in entries {
            match value {
                Some(v) => {
                    map.insert((*key).to_string(), (*v).to_string());
                }
                None => {
                    map.remove(*key);
                }
            }
        }
        self.write_map(&map)
    }
}

// ============================================================================
// Memory backend
// ============================================================================

/// Process-local storage; nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ============================================================================
// Credential store
// ============================================================================

/// The sole durable owner of token state.
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn SecretBackend>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Persist all three fields. If any write fails every key is removed
    /// so a partial session is never observable.
    pub fn save(&self, session: &Session) -> Result<(), AuthError> {
        let user_info = match session.user_info {
            Some(ref info) => Some(
                serde_json::to_string(info)
                    .map_err(|e| AuthError::Storage(format!("Failed to serialize user info: {}", e)))?,
            ),
            None => None,
        };

        let entries = [
            (ACCESS_TOKEN_KEY, session.access_token.as_deref()),
            (REFRESH_TOKEN_KEY, session.refresh_token.as_deref()),
            (USER_INFO_KEY, user_info.as_deref()),
        ];

        if let Err(e) = self.backend.set_many(&entries) {
            error!(error = %e, "Failed to save session, clearing partial state");
            if let Err(clear_err) = self.clear() {
                error!(error = %clear_err, "Failed to clear partial session");
            }
            return Err(AuthError::Storage(format!("{:#}", e)));
        }
        Ok(())
    }

    /// Read the stored session. Never fails: unreadable fields are logged
    /// and treated as absent.
    pub fn load(&self) -> Session {
        let access_token = self.read(ACCESS_TOKEN_KEY);
        let refresh_token = self.read(REFRESH_TOKEN_KEY);
        let user_info = self.read(USER_INFO_KEY).and_then(|raw| {
            serde_json::from_str::<UserInfo>(&raw)
                .map_err(|e| warn!(error = %e, "Stored user info is not valid JSON"))
                .ok()
        });

        if access_token.is_some() != refresh_token.is_some() {
            warn!("Stored session has only one of its tokens, ignoring it");
            return Session::default();
        }

        Session {
            access_token,
            refresh_token,
            user_info,
        }
    }

    /// Update only the user-info snapshot, leaving the tokens alone.
    pub fn save_user_info(&self, user_info: &UserInfo) -> Result<(), AuthError> {
        let raw = serde_json::to_string(user_info)
            .map_err(|e| AuthError::Storage(format!("Failed to serialize user info: {}", e)))?;
        self.backend
            .set(USER_INFO_KEY, &raw)
            .map_err(|e| AuthError::Storage(format!("{:#}", e)))
    }

    /// Remove every persisted key.
    pub fn clear(&self) -> Result<(), AuthError> {
        let entries: Vec<(&str, Option<&str>)> = ALL_KEYS.iter().map(|k| (*k, None)).collect();
        self.backend
            .set_many(&entries)
            .map_err(|e| AuthError::Storage(format!("{:#}", e)))
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key = key, error = %e, "Failed to read credential");
                None
            }
        }
    }
}
