use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Multipart, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use relay_client_sdk::credentials::{AuthMode, CredentialStore};
use relay_client_sdk::gateway::{ApiClient, ApiError, AuthEvent};

const GOOD_TOKEN: &str = "good-token";
const STALE_TOKEN: &str = "stale-token";
const FIRST_REFRESH: &str = "refresh-1";
const SECOND_REFRESH: &str = "refresh-2";
const UPLOAD_BYTES: &[u8] = b"hello multipart";

#[derive(Clone, Default)]
struct ApiState {
    refresh_calls: Arc<AtomicUsize>,
    protected_calls: Arc<AtomicUsize>,
    observed_upload: Arc<Mutex<Option<UploadObserved>>>,
}

#[derive(Debug)]
struct UploadObserved {
    content_type: String,
    field_name: String,
    file_name: String,
    bytes: Vec<u8>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct Profile {
    id: String,
    username: String,
}

fn app(state: ApiState) -> Router {
    Router::new()
        .route("/api/profile", get(profile_handler))
        .route("/api/flaky", get(flaky_handler))
        .route("/api/session-check", get(session_check_handler))
        .route("/api/forbidden", get(|| async { forbidden_response() }))
        .route("/api/broken", get(|| async { broken_response() }))
        .route("/api/teapot", get(|| async { teapot_response() }))
        .route("/api/files", post(upload_handler))
        .route("/auth/refresh-token", post(refresh_handler))
        .with_state(state)
}

async fn spawn_server(
    state: ApiState,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app(state))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, shutdown_tx, task)
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

fn envelope(data: Value) -> Json<Value> {
    Json(json!({ "data": data, "message": "ok", "status": 200 }))
}

fn unauthorized_response() -> (StatusCode, Json<Value>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "token expired" })),
    )
}

fn forbidden_response() -> (StatusCode, Json<Value>) {
    (
        StatusCode::FORBIDDEN,
        Json(json!({ "message": "not allowed" })),
    )
}

fn broken_response() -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "message": "boom" })),
    )
}

fn teapot_response() -> (StatusCode, Json<Value>) {
    (
        StatusCode::IM_A_TEAPOT,
        Json(json!({ "message": "short and stout" })),
    )
}

async fn profile_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);
    if bearer(&headers) == Some(GOOD_TOKEN) {
        envelope(json!({ "id": "u1", "username": "alice" })).into_response()
    } else {
        unauthorized_response().into_response()
    }
}

/// 401 until the token is refreshed, then 500. Exercises the rule that a
/// retried request's own failure reaches the caller unmodified.
async fn flaky_handler(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    state.protected_calls.fetch_add(1, Ordering::SeqCst);
    if bearer(&headers) == Some(GOOD_TOKEN) {
        broken_response().into_response()
    } else {
        unauthorized_response().into_response()
    }
}

async fn session_check_handler() -> impl IntoResponse {
    // The session is always treated as expired, whatever was presented.
    unauthorized_response()
}

async fn refresh_handler(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    state.refresh_calls.fetch_add(1, Ordering::SeqCst);
    if body.get("refreshToken").and_then(Value::as_str) == Some(FIRST_REFRESH) {
        envelope(json!({
            "token": GOOD_TOKEN,
            "refreshToken": SECOND_REFRESH,
            "expiresIn": 3600
        }))
        .into_response()
    } else {
        unauthorized_response().into_response()
    }
}

async fn upload_handler(
    State(state): State<ApiState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let field = multipart
        .next_field()
        .await
        .expect("read multipart field")
        .expect("multipart field present");
    let observed = UploadObserved {
        content_type,
        field_name: field.name().unwrap_or_default().to_string(),
        file_name: field.file_name().unwrap_or_default().to_string(),
        bytes: field.bytes().await.expect("read field bytes").to_vec(),
    };
    *state.observed_upload.lock().unwrap() = Some(observed);

    envelope(json!({ "id": "f1" }))
}

fn client_for(addr: SocketAddr, store: CredentialStore) -> ApiClient {
    ApiClient::new(format!("http://{addr}"), store).expect("build api client")
}

fn secret(value: &str) -> SecretString {
    SecretString::new(value.to_string())
}

#[tokio::test]
async fn successful_call_returns_the_envelope_payload() {
    let state = ApiState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(state).await;

    let store = CredentialStore::in_memory();
    store
        .set_jwt(secret(GOOD_TOKEN), secret(FIRST_REFRESH))
        .expect("set jwt");
    let client = client_for(addr, store);

    let profile: Profile = client.get("/api/profile").await.expect("get profile");
    assert_eq!(
        profile,
        Profile {
            id: "u1".to_string(),
            username: "alice".to_string(),
        }
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test]
async fn expired_jwt_is_refreshed_and_retried_exactly_once() {
    let state = ApiState::default();
    let refresh_calls = Arc::clone(&state.refresh_calls);
    let protected_calls = Arc::clone(&state.protected_calls);
    let (addr, shutdown_tx, server_task) = spawn_server(state).await;

    let store = CredentialStore::in_memory();
    store
        .set_jwt(secret(STALE_TOKEN), secret(FIRST_REFRESH))
        .expect("set jwt");
    let client = client_for(addr, store.clone());

    let profile: Profile = client
        .get("/api/profile")
        .await
        .expect("refresh should make the call succeed");
    assert_eq!(profile.username, "alice");

    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(protected_calls.load(Ordering::SeqCst), 2);

    let creds = store.snapshot();
    assert_eq!(creds.access_token.unwrap().expose_secret(), GOOD_TOKEN);
    assert_eq!(creds.refresh_token.unwrap().expose_secret(), SECOND_REFRESH);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test]
async fn expired_jwt_without_refresh_token_expires_the_session() {
    let state = ApiState::default();
    let refresh_calls = Arc::clone(&state.refresh_calls);
    let protected_calls = Arc::clone(&state.protected_calls);
    let (addr, shutdown_tx, server_task) = spawn_server(state).await;

    // JWT mode with a missing refresh token can only come from storage.
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("credentials.json");
    std::fs::write(
        &path,
        json!({
            "auth_token": STALE_TOKEN,
            "refresh_token": null,
            "session_id": null,
            "auth_mode": "jwt"
        })
        .to_string(),
    )
    .expect("seed credential file");

    let store = CredentialStore::open(&path).expect("open store");
    let client = client_for(addr, store.clone());
    let mut auth_events = client.subscribe_auth_events();

    let result: Result<Profile, ApiError> = client.get("/api/profile").await;
    assert!(matches!(result, Err(ApiError::AuthExpired)));

    assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);
    assert_eq!(protected_calls.load(Ordering::SeqCst), 1);

    let creds = store.snapshot();
    assert_eq!(creds.mode, AuthMode::None);
    assert!(creds.access_token.is_none());
    assert!(creds.refresh_token.is_none());
    assert!(creds.session_id.is_none());
    assert_eq!(
        auth_events.try_recv().expect("session expired event"),
        AuthEvent::SessionExpired
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test]
async fn session_mode_401_expires_without_any_refresh_call() {
    let state = ApiState::default();
    let refresh_calls = Arc::clone(&state.refresh_calls);
    let (addr, shutdown_tx, server_task) = spawn_server(state).await;

    let store = CredentialStore::in_memory();
    store
        .set_session(secret("ldap-token"), "sess-42")
        .expect("set session");
    let client = client_for(addr, store.clone());
    let mut auth_events = client.subscribe_auth_events();

    let result: Result<Value, ApiError> = client.get("/api/session-check").await;
    assert!(matches!(result, Err(ApiError::AuthExpired)));
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 0);

    let creds = store.snapshot();
    assert_eq!(creds.mode, AuthMode::None);
    assert!(creds.session_id.is_none());
    assert_eq!(
        auth_events.try_recv().expect("session expired event"),
        AuthEvent::SessionExpired
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test]
async fn forbidden_server_and_other_statuses_map_to_their_variants() {
    let state = ApiState::default();
    let (addr, shutdown_tx, server_task) = spawn_server(state).await;
    let client = client_for(addr, CredentialStore::in_memory());

    let forbidden: Result<Value, ApiError> = client.get("/api/forbidden").await;
    match forbidden {
        Err(ApiError::Forbidden { body }) => assert_eq!(body, "not allowed"),
        other => panic!("expected Forbidden, got {other:?}"),
    }

    let broken: Result<Value, ApiError> = client.get("/api/broken").await;
    match broken {
        Err(ApiError::Server { body }) => assert_eq!(body, "boom"),
        other => panic!("expected Server, got {other:?}"),
    }

    let teapot: Result<Value, ApiError> = client.get("/api/teapot").await;
    match teapot {
        Err(ApiError::HttpStatus { status, .. }) => {
            assert_eq!(status, StatusCode::IM_A_TEAPOT);
        }
        other => panic!("expected HttpStatus, got {other:?}"),
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test]
async fn retried_request_failure_reaches_the_caller_unmodified() {
    let state = ApiState::default();
    let refresh_calls = Arc::clone(&state.refresh_calls);
    let (addr, shutdown_tx, server_task) = spawn_server(state).await;

    let store = CredentialStore::in_memory();
    store
        .set_jwt(secret(STALE_TOKEN), secret(FIRST_REFRESH))
        .expect("set jwt");
    let client = client_for(addr, store.clone());

    let result: Result<Value, ApiError> = client.get("/api/flaky").await;
    assert!(matches!(result, Err(ApiError::Server { .. })));
    assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);

    // The refresh itself succeeded, so the renewed pair stays stored.
    let creds = store.snapshot();
    assert_eq!(creds.access_token.unwrap().expose_secret(), GOOD_TOKEN);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test]
async fn upload_file_sends_multipart_form_data() {
    let state = ApiState::default();
    let observed_upload = Arc::clone(&state.observed_upload);
    let (addr, shutdown_tx, server_task) = spawn_server(state).await;
    let client = client_for(addr, CredentialStore::in_memory());

    let record: Value = client
        .upload_file("/api/files", "notes.txt", UPLOAD_BYTES.to_vec())
        .await
        .expect("upload file");
    assert_eq!(record, json!({ "id": "f1" }));

    let observed = observed_upload
        .lock()
        .unwrap()
        .take()
        .expect("upload observed");
    assert!(observed.content_type.starts_with("multipart/form-data"));
    assert_eq!(observed.field_name, "file");
    assert_eq!(observed.file_name, "notes.txt");
    assert_eq!(observed.bytes, UPLOAD_BYTES);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}
