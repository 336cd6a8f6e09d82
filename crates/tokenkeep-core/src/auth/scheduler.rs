//! Proactive renewal timer.
//!
//! At most one timer is live at a time. Arming always replaces whatever
//! was armed before; disarming is idempotent.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::claims::decode_claims;

/// Renew this many seconds before the token expires.
pub const DEFAULT_LEAD_SECS: i64 = 60;

/// Never fire sooner than this many seconds after arming.
pub const DEFAULT_MIN_DELAY_SECS: i64 = 30;

/// When to fire relative to a token's expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenewalPolicy {
    pub lead_secs: i64,
    pub min_delay_secs: i64,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            lead_secs: DEFAULT_LEAD_SECS,
            min_delay_secs: DEFAULT_MIN_DELAY_SECS,
        }
    }
}

impl RenewalPolicy {
    /// `max(expires_at - now - lead, min_delay)` seconds.
    pub fn delay_for(&self, expires_at: i64, now: i64) -> Duration {
        let secs = expires_at
            .saturating_sub(now)
            .saturating_sub(self.lead_secs)
            .max(self.min_delay_secs)
            .max(0);
        Duration::from_secs(secs as u64)
    }
}

struct Armed {
    generation: u64,
    /// `None` when the fire time is past what a calendar date can hold
    fire_at: Option<DateTime<Utc>>,
    handle: JoinHandle<()>,
}

/// Owns the single pending renewal timer.
pub struct RefreshScheduler {
    policy: RenewalPolicy,
    slot: Arc<Mutex<Option<Armed>>>,
    generation: AtomicU64,
}

impl RefreshScheduler {
    pub fn new(policy: RenewalPolicy) -> Self {
        Self {
            policy,
            slot: Arc::new(Mutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> RenewalPolicy {
        self.policy
    }

    /// Schedule `on_fire` ahead of `access_token`'s expiry.
    ///
    /// Returns the delay, or `None` when the token carries no decodable
    /// expiry; in that case nothing changes and renewal falls back to the
    /// reactive 401 path.
    pub fn arm<F, Fut>(&self, access_token: &str, on_fire: F) -> Option<Duration>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.arm_at(access_token, Utc::now().timestamp(), on_fire)
    }

    /// [`arm`](Self::arm) with an explicit current time in epoch seconds.
    pub fn arm_at<F, Fut>(&self, access_token: &str, now: i64, on_fire: F) -> Option<Duration>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(claims) = decode_claims(access_token) else {
            debug!("Access token has no readable expiry, proactive renewal disabled");
            return None;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, proactive renewal disabled");
            return None;
        };

        let delay = self.policy.delay_for(claims.expires_at, now);
        let fire_at = i64::try_from(delay.as_secs())
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|d| {
                DateTime::<Utc>::from_timestamp(now, 0)
                    .unwrap_or_else(Utc::now)
                    .checked_add_signed(d)
            });
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let mut guard = self.slot.lock();
        if let Some(previous) = guard.take() {
            previous.handle.abort();
        }

        let slot = Arc::clone(&self.slot);
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // Leave the slot before firing so a renewal that re-arms
                // (or disarms) never aborts the task running it.
                let mut slot = slot.lock();
                match slot.as_ref() {
                    Some(armed) if armed.generation == generation => {
                        slot.take();
                    }
                    _ => return,
                }
            }
            debug!("Scheduled renewal firing");
            on_fire().await;
        });

        *guard = Some(Armed {
            generation,
            fire_at,
            handle,
        });
        debug!(delay_secs = delay.as_secs(), "Scheduled proactive renewal");
        Some(delay)
    }

    /// Cancel the pending timer, if any.
    pub fn disarm(&self) {
        if let Some(armed) = self.slot.lock().take() {
            armed.handle.abort();
            debug!("Scheduled renewal cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Wall-clock time the pending timer fires, for display
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.slot.lock().as_ref().and_then(|armed| armed.fire_at)
    }
}

impl Default for RefreshScheduler {
    fn default() -> Self {
        Self::new(RenewalPolicy::default())
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}
