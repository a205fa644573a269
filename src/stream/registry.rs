//! Keyed cache of live stream connections.
//!
//! The key is the fully resolved endpoint URL, so query-string variants are
//! distinct connections by design. The first subscriber to a key opens the
//! transport eagerly; later subscribers share it. `disconnect` is a hard
//! teardown, not a reference-counted release.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::Client;
use tracing::debug;

use crate::credentials::CredentialStore;
use crate::gateway::resolve_url;
use crate::stream::connection::{ListenerGuard, StreamConnection, StreamOptions};
use crate::stream::proto::StreamEvent;

/// Cloneable registry mapping resolved URLs to live connections.
#[derive(Clone)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    http: Client,
    base_url: String,
    credentials: CredentialStore,
    streams: Mutex<HashMap<String, Arc<StreamConnection>>>,
}

impl StreamRegistry {
    pub(crate) fn new(http: Client, base_url: String, credentials: CredentialStore) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                http,
                base_url,
                credentials,
                streams: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Subscribes to a stream endpoint.
    ///
    /// Creates and connects the connection on the first subscription to a
    /// URL; every later subscription reuses it (and its original `options`).
    pub fn subscribe(&self, url: &str, options: StreamOptions) -> Subscription {
        let key = resolve_url(&self.inner.base_url, url);
        let connection = {
            let mut streams = self.lock_streams();
            match streams.entry(key.clone()) {
                Entry::Occupied(existing) => Arc::clone(existing.get()),
                Entry::Vacant(vacant) => {
                    debug!(event = "stream_opened", key = %key);
                    let connection = Arc::new(StreamConnection::new(
                        self.inner.http.clone(),
                        key.clone(),
                        options,
                        self.inner.credentials.clone(),
                    ));
                    connection.connect();
                    Arc::clone(vacant.insert(connection))
                }
            }
        };

        Subscription {
            key,
            connection,
            registry: self.clone(),
        }
    }

    /// Closes the connection for `key` and forgets it, regardless of how
    /// many listeners remain attached.
    pub fn disconnect(&self, key: &str) {
        if let Some(connection) = self.lock_streams().remove(key) {
            debug!(event = "stream_disconnected", key = %key);
            connection.disconnect();
        }
    }

    /// Closes and clears every tracked connection. Used for global teardown
    /// such as application shutdown or logout.
    pub fn disconnect_all(&self) {
        let drained: Vec<_> = self.lock_streams().drain().collect();
        for (key, connection) in drained {
            debug!(event = "stream_disconnected", key = %key);
            connection.disconnect();
        }
    }

    /// Number of currently tracked connections.
    pub fn active_streams(&self) -> usize {
        self.lock_streams().len()
    }

    fn lock_streams(&self) -> MutexGuard<'_, HashMap<String, Arc<StreamConnection>>> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle returned to a subscriber.
///
/// Owning the handle does not imply owning the connection: the connection is
/// shared by every subscriber to the same URL and torn down only by
/// [`Subscription::disconnect`] (or a registry-wide teardown).
pub struct Subscription {
    key: String,
    connection: Arc<StreamConnection>,
    registry: StreamRegistry,
}

impl Subscription {
    /// The resolved URL identifying the shared connection.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Registers a listener on the shared connection.
    pub fn add_listener(
        &self,
        listener: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        self.connection.add_listener(listener)
    }

    /// True while the shared connection's transport task is alive.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Hard teardown: closes the transport for every subscriber and removes
    /// the key so the next subscribe opens a brand-new connection.
    pub fn disconnect(&self) {
        self.registry.disconnect(&self.key);
    }
}
