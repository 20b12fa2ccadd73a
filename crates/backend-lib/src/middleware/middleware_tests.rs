use super::*;
use crate::auth::{StaticIdentityVerifier, TokenKind};
use crate::config::Settings;
use crate::storage::{DocumentStore, MemoryDocumentStore, SetMode};
use crate::AppState;
use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, Request, StatusCode},
    middleware::from_fn_with_state,
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.jwt_secret = "01234567890123456789012345678901".into();
    settings.auth.google_client_id = "client".into();
    settings.auth.firebase_project_id = "project".into();
    settings.rate_limit.api.capacity = 2;
    settings
}

fn state() -> (AppState, Arc<MemoryDocumentStore>) {
    let store = Arc::new(MemoryDocumentStore::new());
    let state = AppState::new(settings(), store.clone(), Arc::new(StaticIdentityVerifier::new())).unwrap();
    (state, store)
}

async fn whoami(AuthenticatedSubject(subject): AuthenticatedSubject) -> String {
    subject
}

async fn client_addr(ClientAddr(addr): ClientAddr) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

fn app(state: AppState) -> Router {
    let admin_only = Router::new()
        .route("/admin", get(whoami))
        .route_layer(from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/me", get(whoami))
        .merge(admin_only)
        .route_layer(from_fn_with_state(state.clone(), api_rate_limit))
        .route_layer(from_fn_with_state(state.clone(), require_auth))
        .route("/addr", get(client_addr))
        .with_state(state)
}

fn get_with(uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn error_code(response: axum::response::Response) -> String {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    value["code"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_require_auth() {
    let (state, _) = state();
    let access = state
        .authority
        .issue("u-1", TokenKind::Access, chrono::Duration::hours(1))
        .unwrap();
    let refresh = state
        .authority
        .issue("u-1", TokenKind::Refresh, chrono::Duration::days(1))
        .unwrap();
    let app = app(state);

    // No header
    let response = app.clone().oneshot(get_with("/me", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(response).await, "AUTH_002");

    // Garbage
    let response = app.clone().oneshot(get_with("/me", Some("garbage"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(response).await, "AUTH_001");

    // A refresh credential is not an access credential
    let response = app
        .clone()
        .oneshot(get_with("/me", Some(&refresh.token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Valid access credential
    let response = app.oneshot(get_with("/me", Some(&access.token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"u-1");
}

#[tokio::test]
async fn test_api_rate_limit_is_per_subject() {
    let (state, _) = state();
    let alice = state
        .authority
        .issue("alice", TokenKind::Access, chrono::Duration::hours(1))
        .unwrap();
    let bob = state
        .authority
        .issue("bob", TokenKind::Access, chrono::Duration::hours(1))
        .unwrap();
    let app = app(state);

    for _ in 0..2 {
        let response = app.clone().oneshot(get_with("/me", Some(&alice.token))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(get_with("/me", Some(&alice.token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(error_code(response).await, "RATE_001");

    // Same address, different subject
    let response = app.oneshot(get_with("/me", Some(&bob.token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_require_admin() {
    let (state, store) = state();
    let admin = state
        .authority
        .issue("admin", TokenKind::Access, chrono::Duration::hours(1))
        .unwrap();
    let user = state
        .authority
        .issue("user", TokenKind::Access, chrono::Duration::hours(1))
        .unwrap();

    let mut fields = crate::storage::Document::new();
    fields.insert("isAdmin".into(), json!(true));
    store.set("users/admin", fields, SetMode::Overwrite).await.unwrap();

    let mut fields = crate::storage::Document::new();
    fields.insert("isAdmin".into(), json!("yes"));
    store.set("users/user", fields, SetMode::Overwrite).await.unwrap();

    let app = app(state);

    let response = app.clone().oneshot(get_with("/admin", Some(&admin.token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Non-boolean flag is not admin
    let response = app.oneshot(get_with("/admin", Some(&user.token))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "AUTH_003");
}

#[tokio::test]
async fn test_client_addr_falls_back_to_real_ip_header() {
    let (state, _) = state();
    let app = app(state);

    let request = Request::builder()
        .uri("/addr")
        .header("x-real-ip", "203.0.113.7")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"203.0.113.7");

    // Unparseable header is ignored
    let request = Request::builder()
        .uri("/addr")
        .header("x-real-ip", "not-an-ip")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_panic_becomes_internal_error() {
    async fn boom() -> &'static str {
        panic!("handler exploded")
    }

    let app = Router::new()
        .route("/boom", get(boom))
        .layer(CatchPanicLayer::custom(handle_panic));

    let response = app.oneshot(get_with("/boom", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["error"], "Internal server error");
    // The panic message stays in the logs
    assert!(!String::from_utf8_lossy(&body).contains("exploded"));
}
