//! Composition root for the command-line front end.
//!
//! `App` owns the one `SessionManager` for the process and turns each
//! command into calls on it. Everything printed to stdout is meant for the
//! user; diagnostics go through `tracing` to stderr.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use tokenkeep_core::auth::NEAR_EXPIRY_THRESHOLD_SECS;
use tokenkeep_core::{
    ApiClient, AuthError, AuthState, Config, RefreshScheduler, ReqwestTransport, SessionManager,
};

pub struct App {
    config: Config,
    manager: Arc<SessionManager>,
}

impl App {
    /// Load configuration, wire the session manager and restore any saved
    /// session.
    pub fn new() -> Result<Self> {
        debug!("App::new() starting");
        let config = match Config::load() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to load config, using defaults");
                Config::default()
            }
        };
        debug!(api_url = %config.api_url, storage = ?config.storage, "Config loaded");

        let transport = ReqwestTransport::new(&config.api_url, config.request_timeout())
            .context("Failed to build HTTP client")?;
        let store = config
            .credential_store()
            .context("Failed to open credential store")?;
        let manager = SessionManager::new(
            ApiClient::new(Arc::new(transport)),
            store,
            RefreshScheduler::new(config.renewal),
        );

        let restored = manager.restore();
        debug!(restored = restored.is_some(), "Session restore finished");

        Ok(Self { config, manager })
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    pub async fn login(&mut self, username: Option<String>) -> Result<()> {
        let username = match username {
            Some(u) => u,
            None => self.prompt_username()?,
        };
        let password = rpassword::prompt_password("Password: ")?;

        if username.is_empty() || password.is_empty() {
            anyhow::bail!("Username and password required");
        }

        println!("Authenticating...");
        let user = self
            .manager
            .login(&username, &password)
            .await
            .map_err(|e| anyhow::anyhow!(describe_error(&e)))?;

        self.config.last_username = Some(username);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }

        println!("Signed in as {}", user.display_name());
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        if !self.manager.is_authenticated() {
            println!("Not signed in");
            return Ok(());
        }
        self.manager.logout().await;
        println!("Signed out");
        Ok(())
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        extra: Vec<(String, String)>,
    ) -> Result<()> {
        let password = rpassword::prompt_password("Password: ")?;

        let mut fields = Map::new();
        fields.insert("username".into(), Value::String(username.to_string()));
        fields.insert("email".into(), Value::String(email.to_string()));
        fields.insert("password".into(), Value::String(password));
        for (key, value) in extra {
            fields.insert(key, Value::String(value));
        }

        let response = self
            .manager
            .register(&Value::Object(fields))
            .await
            .map_err(|e| anyhow::anyhow!(describe_error(&e)))?;

        info!(username = username, "Account created");
        println!("Account created for {}. Run `tokenkeep login` to sign in.", username);
        if let Some(message) = response.get("message").and_then(Value::as_str) {
            println!("{}", message);
        }
        Ok(())
    }

    fn prompt_username(&self) -> Result<String> {
        match self.config.last_username {
            Some(ref last) => print!("Username [{}]: ", last),
            None => print!("Username: "),
        }
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();

        Ok(match (input.is_empty(), &self.config.last_username) {
            (true, Some(last)) => last.clone(),
            _ => input.to_string(),
        })
    }

    // =========================================================================
    // Session info
    // =========================================================================

    pub async fn whoami(&self) -> Result<()> {
        self.require_session()?;
        let user = self
            .manager
            .fetch_user_info()
            .await
            .map_err(|e| anyhow::anyhow!(describe_error(&e)))?;
        println!("{}", serde_json::to_string_pretty(&user)?);
        Ok(())
    }

    pub fn status(&self) -> Result<()> {
        println!("Server:   {}", self.config.api_url);

        let Some(user) = self.manager.current_user() else {
            println!("Status:   signed out");
            return Ok(());
        };
        println!("Status:   signed in as {}", user.display_name());

        match self.manager.token_claims() {
            Some(claims) => {
                let now = chrono::Utc::now().timestamp();
                let remaining = claims.expires_in(now);
                let note = if claims.is_expired(now) {
                    " (expired)"
                } else if claims.is_near_expiry(now, NEAR_EXPIRY_THRESHOLD_SECS) {
                    " (expiring soon)"
                } else {
                    ""
                };
                println!("Token:    expires in {}{}", format_duration(remaining), note);
                if let Some(ref issuer) = claims.issuer {
                    println!("Issuer:   {}", issuer);
                }
                if !claims.roles.is_empty() {
                    println!("Roles:    {}", claims.roles.join(", "));
                }
                if !claims.scope.is_empty() {
                    println!("Scope:    {}", claims.scope.join(" "));
                }
            }
            None => println!("Token:    expiry unknown, renewed on rejection"),
        }

        match self.manager.next_renewal_at() {
            Some(at) => println!("Renewal:  scheduled {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("Renewal:  not scheduled"),
        }
        Ok(())
    }

    // =========================================================================
    // Protected calls
    // =========================================================================

    pub async fn get(&self, path: &str) -> Result<()> {
        self.require_session()?;
        let body = self.fetch(path).await?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        Ok(())
    }

    async fn fetch(&self, path: &str) -> Result<Value> {
        self.manager
            .get_protected::<Value>(path)
            .await
            .map_err(|e| anyhow::anyhow!(describe_error(&e)))
    }

    /// Stay resident, keeping the session renewed, until Ctrl-C or the
    /// session ends. With a path, poll it every `interval`.
    pub async fn watch(&self, path: Option<&str>, interval: Duration) -> Result<()> {
        self.require_session()?;
        let mut states = self.manager.subscribe();
        let mut ticker = tokio::time::interval(interval);

        println!("Watching session (Ctrl-C to stop)");
        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = states.borrow_and_update().clone();
                    match state {
                        AuthState::Authenticated(user) => {
                            println!("[{}] session renewed for {}", timestamp(), user.display_name());
                        }
                        AuthState::Anonymous => {
                            println!("[{}] session ended", timestamp());
                            break;
                        }
                    }
                }
                _ = ticker.tick(), if path.is_some() => {
                    if let Some(path) = path {
                        match self.fetch(path).await {
                            Ok(body) => println!("[{}] {}", timestamp(), body),
                            Err(e) => println!("[{}] {} failed: {}", timestamp(), path, e),
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
            }
        }
        Ok(())
    }

    fn require_session(&self) -> Result<()> {
        if self.manager.is_authenticated() {
            Ok(())
        } else {
            anyhow::bail!("Not signed in. Run `tokenkeep login` first.")
        }
    }

    /// Stop the renewal timer; credentials stay on disk.
    pub fn shutdown(&self) {
        self.manager.shutdown();
    }
}

/// User-facing text for each failure kind.
pub fn describe_error(error: &AuthError) -> String {
    match error {
        AuthError::CredentialsRejected(_) => "Invalid username or password".to_string(),
        AuthError::ValidationFailed { message, details } => match details {
            Some(Value::Object(fields)) if !fields.is_empty() => {
                let mut lines = vec![message.clone()];
                for (field, problems) in fields {
                    lines.push(format!("  {}: {}", field, flatten_problems(problems)));
                }
                lines.join("\n")
            }
            _ => message.clone(),
        },
        e if e.is_session_lost() => "Your session has ended. Please sign in again.".to_string(),
        AuthError::TransportFailure(_) => {
            "Unable to connect to server. Check your network connection.".to_string()
        }
        other => other.to_string(),
    }
}

fn flatten_problems(problems: &Value) -> String {
    match problems {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string).unwrap_or_else(|| item.to_string()))
            .collect::<Vec<_>>()
            .join("; "),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    match secs {
        s if s >= 3600 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{}s", s),
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_describe_credentials_rejected() {
        let msg = describe_error(&AuthError::CredentialsRejected("Invalid credentials".into()));
        assert_eq!(msg, "Invalid username or password");
    }

    #[test]
    fn test_describe_validation_details() {
        let msg = describe_error(&AuthError::ValidationFailed {
            message: "Validation failed".into(),
            details: Some(json!({"email": ["Not a valid email address."]})),
        });
        assert_eq!(msg, "Validation failed\n  email: Not a valid email address.");
    }

    #[test]
    fn test_describe_session_end() {
        for error in [
            AuthError::NoRefreshToken,
            AuthError::RenewalRejected("expired".into()),
            AuthError::SessionLost,
        ] {
            assert!(describe_error(&error).contains("sign in again"));
        }
    }

    #[test]
    fn test_describe_request_failure_passthrough() {
        let error = AuthError::RequestFailed {
            status: 500,
            message: "boom".into(),
        };
        assert_eq!(describe_error(&error), error.to_string());
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(-5), "0s");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(3_720), "1h 2m");
    }
}
