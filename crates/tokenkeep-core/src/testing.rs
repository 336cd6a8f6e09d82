//! Scripted transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::api::{ApiRequest, ApiResponse, AuthError, Result, Transport};
use crate::auth::claims::unsigned_token;
use crate::auth::{MemoryBackend, SecretBackend};

pub(crate) enum Reply {
    Respond(ApiResponse),
    Delayed(Duration, ApiResponse),
    Fail(String),
    /// Panics inside `send`, as a buggy transport would
    Panic,
}

/// Answers each `(method, path)` from a queue of scripted replies and
/// records every request it sees.
#[derive(Default)]
pub(crate) struct MockTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn push(&self, method: Method, path: &str, reply: Reply) {
        self.routes
            .lock()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub(crate) fn respond(&self, method: Method, path: &str, response: ApiResponse) {
        self.push(method, path, Reply::Respond(response));
    }

    pub(crate) fn calls(&self, path: &str) -> usize {
        self.requests.lock().iter().filter(|r| r.path == path).count()
    }

    pub(crate) fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.requests.lock().push(request.clone());
        let reply = self
            .routes
            .lock()
            .get_mut(&(request.method.clone(), request.path.clone()))
            .and_then(VecDeque::pop_front);

        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Delayed(delay, response)) => {
                tokio::time::sleep(delay).await;
                Ok(response)
            }
            Some(Reply::Fail(message)) => Err(AuthError::TransportFailure(message)),
            Some(Reply::Panic) => panic!("transport blew up"),
            None => Ok(json_response(404, serde_json::json!({"error": "no scripted reply"}))),
        }
    }
}

/// Secret backend that accepts the first `budget` writes, then fails.
/// Reads and removals always succeed.
pub(crate) struct FlakyBackend {
    inner: MemoryBackend,
    budget: Mutex<usize>,
}

impl FlakyBackend {
    pub(crate) fn new(budget: usize) -> Self {
        Self {
            inner: MemoryBackend::new(),
            budget: Mutex::new(budget),
        }
    }

    pub(crate) fn set_budget(&self, budget: usize) {
        *self.budget.lock() = budget;
    }
}

impl SecretBackend for FlakyBackend {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut budget = self.budget.lock();
        if *budget == 0 {
            anyhow::bail!("disk full");
        }
        *budget -= 1;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner.remove(key)
    }
}

pub(crate) fn json_response(status: u16, body: Value) -> ApiResponse {
    ApiResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: HeaderMap::new(),
        body: body.to_string(),
    }
}

pub(crate) fn with_header(mut response: ApiResponse, name: &str, value: &'static str) -> ApiResponse {
    response.headers.insert(
        HeaderName::from_bytes(name.as_bytes()).unwrap(),
        HeaderValue::from_static(value),
    );
    response
}

/// An unsigned JWT expiring `secs` from now, tagged so tests can tell
/// tokens apart.
pub(crate) fn token_expiring_in(secs: i64, tag: &str) -> String {
    let exp = chrono::Utc::now().timestamp() + secs;
    unsigned_token(&serde_json::json!({ "exp": exp, "jti": tag }))
}

pub(crate) fn bearer_of(request: &ApiRequest) -> Option<String> {
    request
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}
