//! Authenticated REST gateway.
//!
//! `ApiClient` wraps every request/response call against the platform API:
//! it resolves paths against the configured base URL, attaches credentials,
//! unwraps the uniform response envelope, and recovers from expired access
//! tokens with a single refresh-and-retry pass. Terminal auth failures are
//! published on a broadcast channel instead of triggering any UI side effect.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::auth::RefreshTokenResponse;
use crate::credentials::{AuthMode, CredentialStore, CredentialStoreError};
use crate::stream::registry::{StreamRegistry, Subscription};
use crate::stream::StreamOptions;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const REFRESH_TOKEN_PATH: &str = "/auth/refresh-token";
const AUTH_EVENT_CAPACITY: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Tuning knobs for [`ApiClient`].
#[derive(Clone, Debug)]
pub struct ApiClientOptions {
    pub connect_timeout: Duration,
    /// Upper bound on the wait for any single request before it is treated
    /// as a network failure.
    pub request_timeout: Duration,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            request_timeout: ApiDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Uniform wrapper around every REST response body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
    pub message: String,
    pub status: u16,
}

/// Auth lifecycle notification published by the gateway.
///
/// The surrounding application decides what to do with it (typically a
/// navigation to a login screen); the SDK only clears credentials.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthEvent {
    /// A 401 was received with no viable refresh path. Credentials have
    /// already been cleared when this fires.
    SessionExpired,
}

/// Request body shapes the gateway can (re-)send.
#[derive(Clone, Debug)]
pub enum Payload {
    /// Raw JSON body.
    Json(Value),
    /// Multipart form upload with a single `file` field.
    Multipart { file_name: String, bytes: Vec<u8> },
}

/// Errors produced by the REST gateway.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport-level failure, no usable response received. Elapsed request
    /// timeouts surface here as well.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// 401 with no viable refresh path. Credentials have been cleared and
    /// [`AuthEvent::SessionExpired`] has been published.
    #[error("session expired")]
    AuthExpired,

    /// 403 from the server.
    #[error("authorization denied: {body}")]
    Forbidden { body: String },

    /// 500 from the server.
    #[error("server failure: {body}")]
    Server { body: String },

    /// Any other non-success status, passed through verbatim.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Request body could not be serialized.
    #[error("failed to encode request body: {0}")]
    EncodeBody(#[source] serde_json::Error),

    /// Response body did not match the expected envelope shape.
    #[error("failed to decode response envelope: {source}; body: {body}")]
    Decode {
        #[source]
        source: serde_json::Error,
        body: String,
    },

    /// Credential store read/write failure.
    #[error(transparent)]
    Credentials(#[from] CredentialStoreError),
}

impl ApiError {
    /// True when the error is the terminal "session expired" condition.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::AuthExpired)
    }
}

/// Authenticated REST gateway with shared stream registry.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    request_timeout: Duration,
    credentials: CredentialStore,
    auth_events: broadcast::Sender<AuthEvent>,
    streams: StreamRegistry,
}

impl ApiClient {
    /// Creates a client with default options.
    pub fn new(
        base_url: impl Into<String>,
        credentials: CredentialStore,
    ) -> Result<Self, ApiError> {
        Self::with_options(base_url, credentials, ApiClientOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(
        base_url: impl Into<String>,
        credentials: CredentialStore,
        options: ApiClientOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let (auth_events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        let streams = StreamRegistry::new(http.clone(), base_url.clone(), credentials.clone());

        Ok(Self {
            http,
            base_url,
            request_timeout: options.request_timeout,
            credentials,
            auth_events,
            streams,
        })
    }

    /// Returns the credential store this client mutates.
    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Subscribes to auth lifecycle events such as
    /// [`AuthEvent::SessionExpired`].
    pub fn subscribe_auth_events(&self) -> broadcast::Receiver<AuthEvent> {
        self.auth_events.subscribe()
    }

    /// GET request returning the unwrapped envelope payload.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::GET, path, None).await
    }

    /// POST request with a JSON body.
    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::POST, path, Some(json_payload(body)?))
            .await
    }

    /// POST request without a body.
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::POST, path, None).await
    }

    /// PUT request with a JSON body.
    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::PUT, path, Some(json_payload(body)?))
            .await
    }

    /// PATCH request with a JSON body.
    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.request(Method::PATCH, path, Some(json_payload(body)?))
            .await
    }

    /// DELETE request returning the unwrapped envelope payload.
    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.request(Method::DELETE, path, None).await
    }

    /// Uploads a file as `multipart/form-data` under the `file` field.
    /// Otherwise behaves exactly like [`ApiClient::post`].
    pub async fn upload_file<T: DeserializeOwned>(
        &self,
        path: &str,
        file_name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<T, ApiError> {
        self.request(
            Method::POST,
            path,
            Some(Payload::Multipart {
                file_name: file_name.into(),
                bytes,
            }),
        )
        .await
    }

    /// Issues a request and unwraps `Envelope<T>::data` on success.
    ///
    /// A 401 in JWT mode triggers at most one token refresh followed by one
    /// retry of the original request; the retried request's own failure is
    /// surfaced unmodified.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: Option<Payload>,
    ) -> Result<T, ApiError> {
        let url = resolve_url(&self.base_url, path);
        let response = self.send(&method, &url, payload.as_ref()).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && self.credentials.snapshot().mode != AuthMode::None
        {
            let retried = self
                .recover_unauthorized(&method, &url, payload.as_ref())
                .await?;
            return self.complete(retried).await;
        }

        self.complete(response).await
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        payload: Option<&Payload>,
    ) -> Result<Response, ApiError> {
        let mut builder = self
            .http
            .request(method.clone(), url)
            .timeout(self.request_timeout);

        builder = match payload {
            Some(Payload::Json(body)) => builder.json(body),
            Some(Payload::Multipart { file_name, bytes }) => {
                let part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                builder.multipart(Form::new().part("file", part))
            }
            None => builder,
        };

        let creds = self.credentials.snapshot();
        if let Some(token) = creds.access_token.as_ref() {
            builder = builder.bearer_auth(token.expose_secret());
        } else if let Some(session_id) = creds.session_id.as_ref() {
            builder = builder.header("X-Session-ID", session_id);
        }

        builder.send().await.map_err(ApiError::Transport)
    }

    /// Handles a 401 on the initial attempt. Returns the retried response
    /// when a refresh succeeded; otherwise expires the session.
    async fn recover_unauthorized(
        &self,
        method: &Method,
        url: &str,
        payload: Option<&Payload>,
    ) -> Result<Response, ApiError> {
        let creds = self.credentials.snapshot();
        let refresh_token = match (creds.mode, creds.refresh_token) {
            (AuthMode::Jwt, Some(token)) => token,
            _ => {
                self.expire_session();
                return Err(ApiError::AuthExpired);
            }
        };

        match self.refresh_access_token(&refresh_token).await {
            Ok(renewed) => {
                self.credentials.set_jwt(
                    SecretString::new(renewed.token),
                    SecretString::new(renewed.refresh_token),
                )?;
                debug!(event = "access_token_refreshed", url);
                self.send(method, url, payload).await
            }
            Err(err) => {
                debug!(event = "token_refresh_failed", error = %err);
                self.expire_session();
                Err(ApiError::AuthExpired)
            }
        }
    }

    /// Calls the refresh endpoint directly, bypassing the 401 recovery path.
    async fn refresh_access_token(
        &self,
        refresh_token: &SecretString,
    ) -> Result<RefreshTokenResponse, ApiError> {
        let url = resolve_url(&self.base_url, REFRESH_TOKEN_PATH);
        let body = serde_json::json!({ "refreshToken": refresh_token.expose_secret() });

        let response = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::Transport)?;

        let status = response.status();
        let text = response.text().await.map_err(ApiError::Transport)?;
        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        parse_envelope(&text)
    }

    async fn complete<T: DeserializeOwned>(&self, response: Response) -> Result<T, ApiError> {
        let status = response.status();
        let text = response.text().await.map_err(ApiError::Transport)?;

        if status.is_success() {
            return parse_envelope(&text);
        }

        Err(self.classify_failure(status, &text))
    }

    fn classify_failure(&self, status: StatusCode, body: &str) -> ApiError {
        let body = summarize_error_body(body);
        match status {
            StatusCode::FORBIDDEN => {
                warn!(event = "authorization_denied", %body);
                ApiError::Forbidden { body }
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                error!(event = "server_failure", %body);
                ApiError::Server { body }
            }
            _ => ApiError::HttpStatus { status, body },
        }
    }

    fn expire_session(&self) {
        if let Err(err) = self.credentials.clear() {
            warn!(event = "credential_clear_failed", error = %err);
        }
        // Nobody listening is fine; the event is advisory.
        let _ = self.auth_events.send(AuthEvent::SessionExpired);
        debug!(event = "session_expired");
    }

    /// Subscribes to a server-sent event endpoint, reusing an existing
    /// connection for the same resolved URL.
    pub fn stream(&self, url: &str, options: StreamOptions) -> Subscription {
        self.streams.subscribe(url, options)
    }

    /// Closes every tracked stream connection.
    pub fn disconnect_all_streams(&self) {
        self.streams.disconnect_all();
    }

    /// Number of currently tracked stream connections.
    pub fn active_streams(&self) -> usize {
        self.streams.active_streams()
    }
}

fn json_payload<B: Serialize + ?Sized>(body: &B) -> Result<Payload, ApiError> {
    serde_json::to_value(body)
        .map(Payload::Json)
        .map_err(ApiError::EncodeBody)
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<T, ApiError> {
    serde_json::from_str::<Envelope<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|source| ApiError::Decode {
            source,
            body: truncate_body(body),
        })
}

/// Resolves a request path against the base URL. Absolute URLs pass through
/// unchanged; everything else is concatenated with slash normalization so
/// base paths like `https://host/api` are preserved.
pub(crate) fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    let base = base_url.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.message.or(parsed.error) {
            return message;
        }
    }

    truncate_body(body)
}

fn truncate_body(body: &str) -> String {
    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
