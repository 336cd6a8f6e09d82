//! Session lifecycle: login, logout, renewal and authenticated calls.
//!
//! `SessionManager` is the only component that mutates the credential
//! store. Renewal can be requested by the scheduled timer, by a 401 on any
//! protected call, or by a server renewal hint; all three share one
//! in-flight renewal so the refresh token is only ever spent once.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiRequest, ApiResponse, AuthError, Result};

use super::claims::{decode_claims, AccessTokenClaims};
use super::credentials::CredentialStore;
use super::scheduler::RefreshScheduler;
use super::session::{Session, UserInfo};

type RenewalFuture = Shared<BoxFuture<'static, Result<()>>>;

/// What the UI layer is allowed to observe.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AuthState {
    #[default]
    Anonymous,
    Authenticated(UserInfo),
}

impl AuthState {
    pub fn user(&self) -> Option<&UserInfo> {
        match self {
            AuthState::Authenticated(user) => Some(user),
            AuthState::Anonymous => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated(_))
    }
}

pub struct SessionManager {
    api: ApiClient,
    store: CredentialStore,
    scheduler: RefreshScheduler,
    state_tx: watch::Sender<AuthState>,
    loading: AtomicBool,
    /// Bumped by every login and logout; a renewal that started in an
    /// older epoch must not write its result.
    epoch: AtomicU64,
    inflight: Mutex<Option<RenewalFuture>>,
}

impl SessionManager {
    pub fn new(api: ApiClient, store: CredentialStore, scheduler: RefreshScheduler) -> Arc<Self> {
        let (state_tx, _) = watch::channel(AuthState::Anonymous);
        Arc::new(Self {
            api,
            store,
            scheduler,
            state_tx,
            loading: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
            inflight: Mutex::new(None),
        })
    }

    // =========================================================================
    // Observable state
    // =========================================================================

    /// Pick up a session persisted by a previous run.
    pub fn restore(self: &Arc<Self>) -> Option<UserInfo> {
        let session = self.store.load();
        let user = match session.access_token() {
            Some(access_token) => {
                let user = session.user_info.clone().unwrap_or_default();
                self.arm_scheduler(access_token);
                self.publish(AuthState::Authenticated(user.clone()));
                info!("Restored saved session");
                Some(user)
            }
            None => {
                debug!("No saved session");
                None
            }
        };
        self.loading.store(false, Ordering::SeqCst);
        user
    }

    /// True until [`restore`](Self::restore) has run
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> AuthState {
        self.state_tx.borrow().clone()
    }

    pub fn current_user(&self) -> Option<UserInfo> {
        self.state_tx.borrow().user().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state_tx.borrow().is_authenticated()
    }

    /// Display-only view of the current access token's claims
    pub fn token_claims(&self) -> Option<AccessTokenClaims> {
        self.store.load().access_token().and_then(decode_claims)
    }

    pub fn next_renewal_at(&self) -> Option<DateTime<Utc>> {
        self.scheduler.next_fire_at()
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Host teardown: stop the timer but keep the stored session.
    pub fn shutdown(&self) {
        self.scheduler.disarm();
    }

    fn publish(&self, state: AuthState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn arm_scheduler(self: &Arc<Self>, access_token: &str) {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.arm(access_token, move || async move {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            // A failed renewal has already collapsed the session.
            if let Err(e) = manager.renew().await {
                warn!(error = %e, "Scheduled renewal failed");
            }
        });
    }

    // =========================================================================
    // Login / logout
    // =========================================================================

    /// Sign in and persist the returned session. Failures are returned as-is
    /// and leave the session anonymous.
    pub async fn login(self: &Arc<Self>, username: &str, password: &str) -> Result<UserInfo> {
        let response = match self.api.login(username, password).await {
            Ok(response) => response,
            Err(e) => {
                warn!(username = username, error = %e, "Login failed");
                return Err(e);
            }
        };

        self.epoch.fetch_add(1, Ordering::SeqCst);
        let user = response.user_info;
        let session = Session::new(
            response.access_token,
            response.refresh_token,
            Some(user.clone()),
        );
        if let Err(e) = self.store.save(&session) {
            // The store is empty now; nothing from an earlier session survives.
            error!(error = %e, "Failed to persist session after login");
            self.scheduler.disarm();
            self.publish(AuthState::Anonymous);
            return Err(e);
        }

        if let Some(access_token) = session.access_token() {
            self.arm_scheduler(access_token);
        }
        self.publish(AuthState::Authenticated(user.clone()));
        info!(username = username, "Login successful");
        Ok(user)
    }

    /// Sign out. Local state is always cleared, even when the server
    /// cannot be told.
    pub async fn logout(&self) {
        self.scheduler.disarm();
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let session = self.store.load();
        if let Some(refresh_token) = session.refresh_token() {
            if let Err(e) = self.api.logout(refresh_token).await {
                warn!(error = %e, "Failed to notify server of logout");
            }
        }

        if let Err(e) = self.store.clear() {
            error!(error = %e, "Failed to clear stored session");
        }
        self.publish(AuthState::Anonymous);
        info!("Logged out");
    }

    /// Create an account. Does not sign in.
    pub async fn register(&self, fields: &Value) -> Result<Value> {
        self.api.register(fields).await
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    /// Exchange the refresh token for a new pair.
    ///
    /// Concurrent callers share one remote call. Any failure signs the
    /// user out before the error is returned.
    pub async fn renew(self: &Arc<Self>) -> Result<()> {
        let renewal = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref() {
                Some(renewal) => {
                    debug!("Joining in-flight renewal");
                    renewal.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        let result = this.renew_once().await;
                        this.inflight.lock().take();
                        result
                    });
                    let owner = Arc::clone(self);
                    let renewal = async move {
                        task.await.unwrap_or_else(|e| {
                            owner.inflight.lock().take();
                            error!(error = %e, "Renewal task did not complete");
                            Err(AuthError::Internal(format!("renewal task failed: {}", e)))
                        })
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(renewal.clone());
                    renewal
                }
            }
        };
        renewal.await
    }

    async fn renew_once(self: &Arc<Self>) -> Result<()> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let session = self.store.load();

        let Some(refresh_token) = session.refresh_token().map(str::to_string) else {
            warn!("Renewal requested without a refresh token");
            self.logout().await;
            return Err(AuthError::NoRefreshToken);
        };

        let pair = match self.api.refresh(&refresh_token).await {
            Ok(pair) => pair,
            Err(e) => {
                if let Some(outcome) = self.superseded(epoch) {
                    debug!(error = %e, "Renewal failed after the session changed, ignoring");
                    return outcome;
                }
                warn!(error = %e, "Token renewal failed, signing out");
                self.logout().await;
                return Err(e);
            }
        };

        if let Some(outcome) = self.superseded(epoch) {
            debug!("Session changed during renewal, discarding renewed tokens");
            return outcome;
        }

        let renewed = Session::new(pair.access_token, pair.refresh_token, session.user_info);
        if let Err(e) = self.store.save(&renewed) {
            error!(error = %e, "Failed to persist renewed session");
            self.logout().await;
            return Err(e);
        }

        if let Some(access_token) = renewed.access_token() {
            self.arm_scheduler(access_token);
        }
        self.publish(AuthState::Authenticated(
            renewed.user_info.unwrap_or_default(),
        ));
        info!("Session renewed");
        Ok(())
    }

    /// Outcome for a renewal that started in `epoch` when a login or logout
    /// has happened since: the newer session stands and is left untouched.
    fn superseded(&self, epoch: u64) -> Option<Result<()>> {
        if self.epoch.load(Ordering::SeqCst) == epoch {
            return None;
        }
        Some(if self.store.load().is_complete() {
            Ok(())
        } else {
            Err(AuthError::SessionLost)
        })
    }

    fn spawn_hinted_renewal(self: &Arc<Self>) {
        debug!("Server hinted renewal");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.renew().await {
                warn!(error = %e, "Hinted renewal failed");
            }
        });
    }

    // =========================================================================
    // Authenticated calls
    // =========================================================================

    /// Send `request` with the current access token.
    ///
    /// A 401 triggers one renewal and one resend; if renewal fails the
    /// session is gone and `SessionLost` is returned. A renewal hint on the
    /// response schedules a background renewal without touching the result.
    pub async fn call_protected(self: &Arc<Self>, request: ApiRequest) -> Result<ApiResponse> {
        let mut renewed = false;
        loop {
            let access_token = self.store.load().access_token().map(str::to_string);
            let response = self
                .api
                .send(request.authorized(access_token.as_deref())?)
                .await?;

            if response.is_unauthorized() && !renewed {
                debug!(path = %request.path, "Access token rejected, renewing");
                if let Err(e) = self.renew().await {
                    debug!(error = %e, "Renewal after rejection failed");
                    return Err(AuthError::SessionLost);
                }
                renewed = true;
                continue;
            }

            if response.refresh_hint() && !renewed {
                self.spawn_hinted_renewal();
            }
            return response.error_for_status();
        }
    }

    pub async fn get_protected<T: DeserializeOwned>(self: &Arc<Self>, path: &str) -> Result<T> {
        self.call_protected(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_protected<T: DeserializeOwned, B: Serialize>(
        self: &Arc<Self>,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.call_protected(ApiRequest::post(path, body)?).await?.json()
    }

    /// Fetch the profile from the server and refresh the stored snapshot.
    pub async fn fetch_user_info(self: &Arc<Self>) -> Result<UserInfo> {
        let user: UserInfo = self
            .call_protected(ApiClient::userinfo_request())
            .await?
            .json()?;

        if self.store.load().is_complete() {
            if let Err(e) = self.store.save_user_info(&user) {
                warn!(error = %e, "Failed to save user info");
            }
            self.publish(AuthState::Authenticated(user.clone()));
        }
        Ok(user)
    }
}
