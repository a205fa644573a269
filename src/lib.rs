//! User-facing Rust SDK for the Relay platform REST and streaming APIs.
//!
//! The crate is organized by transport surface:
//! - `gateway`: authenticated REST gateway with transparent token refresh.
//! - `auth`: auth endpoints and account types.
//! - `credentials`: durable credential store shared by both transports.
//! - `stream`: server-sent event subscriptions with one shared connection
//!   per endpoint.

/// Typed auth endpoints and account types.
pub mod auth;
/// Credential store with optional on-disk persistence.
pub mod credentials;
/// Authenticated REST gateway and error taxonomy.
pub mod gateway;
/// Server-sent event connections, registry, and typed payloads.
pub mod stream;
