//! Test utilities for the Neurodyx backend integration tests
//!
//! Builds a full router over a flat-file store in a temporary directory and a
//! static identity verifier that knows a few external credentials.

#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{header::AUTHORIZATION, header::CONTENT_TYPE, Request, StatusCode},
    Router,
};
use neurodyx_backend_lib::{
    auth::{IdentityClaims, IdentityProvider, StaticIdentityVerifier, VerifiedIdentity},
    config::Settings,
    create_router,
    storage::{DocumentStore, FlatFileDocumentStore},
    AppState,
};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const ADA_FIREBASE_TOKEN: &str = "firebase-id-token-ada";
pub const BOB_GOOGLE_TOKEN: &str = "google-id-token-bob";

pub struct TestEnv {
    pub app: Router,
    pub state: AppState,
    pub store: Arc<FlatFileDocumentStore>,
    pub verifier: Arc<StaticIdentityVerifier>,
    /// Keep in scope to prevent cleanup during the test
    pub temp_dir: TempDir,
}

pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.auth.jwt_secret = "01234567890123456789012345678901".into();
    settings.auth.google_client_id = "client.apps.googleusercontent.com".into();
    settings.auth.firebase_project_id = "neurodyx-test".into();
    settings
}

/// Sets up a full application over a temporary flat-file store
pub fn setup_test_env_with(settings: Settings) -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FlatFileDocumentStore::new(temp_dir.path()).unwrap());
    let verifier = Arc::new(
        StaticIdentityVerifier::new()
            .with_identity(
                ADA_FIREBASE_TOKEN,
                IdentityProvider::Firebase,
                VerifiedIdentity {
                    subject: "ada".into(),
                    claims: IdentityClaims {
                        email: Some("ada@example.com".into()),
                        name: Some("Ada".into()),
                        ..Default::default()
                    },
                },
            )
            .with_subject(BOB_GOOGLE_TOKEN, IdentityProvider::Google, "bob"),
    );

    let state = AppState::new(settings, store.clone(), verifier.clone()).unwrap();
    let app = create_router(state.clone());

    TestEnv {
        app,
        state,
        store,
        verifier,
        temp_dir,
    }
}

pub fn setup_test_env() -> TestEnv {
    setup_test_env_with(test_settings())
}

pub fn json_request(method: &str, uri: &str, bearer: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .header("x-real-ip", "198.51.100.1");
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn empty_request(method: &str, uri: &str, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

/// Send a request and decode the JSON body (`Null` when empty)
pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into()))
    };
    (status, value)
}

/// Log in through `/api/auth`; returns `(access, refresh)`
pub async fn login(app: &Router, token: &str, auth_type: &str) -> (String, String) {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/api/auth",
            None,
            serde_json::json!({"token": token, "authType": auth_type}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    (
        body["token"].as_str().unwrap().to_string(),
        body["refreshToken"].as_str().unwrap().to_string(),
    )
}

/// Mark `subject` as an admin
pub async fn make_admin(store: &FlatFileDocumentStore, subject: &str) {
    let mut fields = serde_json::Map::new();
    fields.insert("isAdmin".into(), Value::Bool(true));
    store
        .set(&format!("users/{subject}"), fields, neurodyx_backend_lib::storage::SetMode::MergeAll)
        .await
        .unwrap();
}
