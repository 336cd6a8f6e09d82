//! End-to-end session flows against a mock HTTP server.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Value};
use tempfile::TempDir;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use tokenkeep_core::auth::FileBackend;
use tokenkeep_core::{
    ApiClient, ApiRequest, AuthError, CredentialStore, RefreshScheduler, ReqwestTransport,
    SessionManager,
};

fn token(tag: &str, expires_in: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + expires_in;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(json!({"exp": exp, "jti": tag}).to_string());
    format!("{}.{}.sig", header, payload)
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

struct Harness {
    server: MockServer,
    manager: Arc<SessionManager>,
    store: CredentialStore,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = CredentialStore::new(Arc::new(FileBackend::new(dir.path().join("session.json"))));
    let transport = ReqwestTransport::new(server.uri(), Duration::from_secs(5)).unwrap();
    let manager = SessionManager::new(
        ApiClient::new(Arc::new(transport)),
        store.clone(),
        RefreshScheduler::default(),
    );
    Harness {
        server,
        manager,
        store,
        _dir: dir,
    }
}

async fn mount_login(server: &MockServer, access: &str, refresh: &str) {
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_json(json!({"username": "alice", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access,
            "refresh_token": refresh,
            "user_info": {"username": "alice", "email": "alice@example.com"}
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_login_persists_session_to_file() {
    let h = harness().await;
    let access = token("first", 3600);
    mount_login(&h.server, &access, "refresh-1").await;

    let user = h.manager.login("alice", "secret").await.unwrap();

    assert_eq!(user.username(), Some("alice"));
    let stored = h.store.load();
    assert_eq!(stored.access_token(), Some(access.as_str()));
    assert_eq!(stored.refresh_token(), Some("refresh-1"));
    assert!(h.manager.next_renewal_at().is_some());
}

#[tokio::test]
async fn test_expired_token_is_renewed_and_request_retried() {
    let h = harness().await;
    let first = token("first", 3600);
    let second = token("second", 3600);
    mount_login(&h.server, &first, "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/api/protected"))
        .and(header("authorization", bearer(&first).as_str()))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Token expired"})))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({"refresh_token": "refresh-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": second,
            "refresh_token": "refresh-2"
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/protected"))
        .and(header("authorization", bearer(&second).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "hello alice"})))
        .expect(1)
        .mount(&h.server)
        .await;

    h.manager.login("alice", "secret").await.unwrap();
    let body: Value = h.manager.get_protected("/api/protected").await.unwrap();

    assert_eq!(body["message"], "hello alice");
    assert_eq!(h.store.load().refresh_token(), Some("refresh-2"));
    assert!(h.manager.is_authenticated());
}

#[tokio::test]
async fn test_rejected_renewal_signs_out() {
    let h = harness().await;
    let first = token("first", 3600);
    mount_login(&h.server, &first, "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/api/protected"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"error": "Token expired"})))
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": "Invalid refresh token"})),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "Logged out"})))
        .mount(&h.server)
        .await;

    h.manager.login("alice", "secret").await.unwrap();
    let err = h
        .manager
        .call_protected(ApiRequest::get("/api/protected"))
        .await
        .unwrap_err();

    assert_eq!(err, AuthError::SessionLost);
    assert!(h.store.load().is_empty());
    assert!(!h.manager.is_authenticated());
    assert!(h.manager.next_renewal_at().is_none());
}

#[tokio::test]
async fn test_renewal_hint_leaves_response_untouched() {
    let h = harness().await;
    let first = token("first", 3600);
    let second = token("second", 3600);
    mount_login(&h.server, &first, "refresh-1").await;

    Mock::given(method("GET"))
        .and(path("/api/protected"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Token-Refresh-Needed", "true")
                .set_body_json(json!({"message": "still valid"})),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": second,
            "refresh_token": "refresh-2"
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    h.manager.login("alice", "secret").await.unwrap();
    let body: Value = h.manager.get_protected("/api/protected").await.unwrap();
    assert_eq!(body["message"], "still valid");

    for _ in 0..100 {
        if h.store.load().refresh_token() == Some("refresh-2") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.store.load().access_token(), Some(second.as_str()));
}

#[tokio::test]
async fn test_logout_clears_even_if_server_fails() {
    let h = harness().await;
    mount_login(&h.server, &token("first", 3600), "refresh-1").await;
    Mock::given(method("POST"))
        .and(path("/auth/logout"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&h.server)
        .await;

    h.manager.login("alice", "secret").await.unwrap();
    h.manager.logout().await;

    assert!(h.store.load().is_empty());
    assert!(!h.manager.is_authenticated());
}

#[tokio::test]
async fn test_wrong_password_is_credentials_rejected() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"error": "Invalid credentials"})),
        )
        .mount(&h.server)
        .await;

    let err = h.manager.login("alice", "wrong").await.unwrap_err();
    assert_eq!(err, AuthError::CredentialsRejected("Invalid credentials".into()));
    assert!(h.store.load().is_empty());
}

#[tokio::test]
async fn test_unreachable_server_is_transport_failure() {
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let transport = ReqwestTransport::new(uri, Duration::from_secs(2)).unwrap();
    let manager = SessionManager::new(
        ApiClient::new(Arc::new(transport)),
        CredentialStore::in_memory(),
        RefreshScheduler::default(),
    );

    let err = manager.login("alice", "secret").await.unwrap_err();
    assert!(matches!(err, AuthError::TransportFailure(_)), "got {err:?}");
}

#[tokio::test]
async fn test_register_returns_validation_details() {
    let h = harness().await;
    Mock::given(method("POST"))
        .and(path("/auth/register"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "Validation failed",
            "details": {"email": ["Not a valid email address."]}
        })))
        .mount(&h.server)
        .await;

    let err = h
        .manager
        .register(&json!({"username": "bob", "email": "nope", "password": "pw"}))
        .await
        .unwrap_err();

    match err {
        AuthError::ValidationFailed { message, details } => {
            assert_eq!(message, "Validation failed");
            assert_eq!(details.unwrap()["email"][0], "Not a valid email address.");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!h.manager.is_authenticated());
}
