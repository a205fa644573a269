//! Server-sent event modules.
//!
//! - `connection`: one SSE transport with listener fan-out.
//! - `registry`: keyed cache of live connections, one per resolved URL.
//! - `proto`: the parsed stream event and typed payloads.
//! - `service`: convenience subscriptions for well-known endpoints.

/// SSE transport, listener set, and lifecycle callbacks.
pub mod connection;
/// Stream event shape and typed payload messages.
pub mod proto;
/// Keyed connection cache and subscription handles.
pub mod registry;
/// Convenience wrappers over well-known streaming endpoints.
pub mod service;

pub use connection::{ListenerGuard, StreamConnection, StreamOptions, TransportError};
pub use proto::StreamEvent;
pub use registry::{StreamRegistry, Subscription};
