use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque user profile returned by the authentication service.
///
/// The engine never interprets it beyond a few display helpers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserInfo(pub Value);

impl UserInfo {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn username(&self) -> Option<&str> {
        self.str_field("username")
            .or_else(|| self.str_field("preferred_username"))
    }

    pub fn email(&self) -> Option<&str> {
        self.str_field("email")
    }

    /// Best human-readable name for display
    pub fn display_name(&self) -> String {
        let first = self.str_field("first_name").or_else(|| self.str_field("given_name"));
        let last = self.str_field("last_name").or_else(|| self.str_field("family_name"));
        match (first, last) {
            (Some(f), Some(l)) => format!("{} {}", f, l),
            (Some(f), None) => f.to_string(),
            _ => self
                .username()
                .or_else(|| self.email())
                .unwrap_or("unknown user")
                .to_string(),
        }
    }
}

impl From<Value> for UserInfo {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Everything the credential store persists for one signed-in user.
///
/// Tokens are set and cleared as a pair; a session holding only one of
/// them is treated as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub user_info: Option<UserInfo>,
}

impl Session {
    pub fn new(access_token: String, refresh_token: String, user_info: Option<UserInfo>) -> Self {
        Self {
            access_token: Some(access_token),
            refresh_token: Some(refresh_token),
            user_info,
        }
    }

    /// Both tokens present
    pub fn is_complete(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none() && self.user_info.is_none()
    }

    /// Get the bearer token if the session is complete
    pub fn access_token(&self) -> Option<&str> {
        if self.is_complete() {
            self.access_token.as_deref()
        } else {
            None
        }
    }

    pub fn refresh_token(&self) -> Option<&str> {
        if self.is_complete() {
            self.refresh_token.as_deref()
        } else {
            None
        }
    }
}
