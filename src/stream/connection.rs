//! Single server-sent event connection with listener fan-out.
//!
//! A `StreamConnection` owns one `EventSource` on a background task and
//! forwards each parsed frame to every registered listener in registration
//! order. The transport cannot carry custom headers, so the access token is
//! appended to the URL as a `token` query parameter on connect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use secrecy::ExposeSecret;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::credentials::CredentialStore;
use crate::stream::proto::StreamEvent;

pub use reqwest_eventsource::Error as TransportError;

/// Reserved event name signaling end-of-stream.
pub const COMPLETE_EVENT: &str = "complete";

type Callback = Arc<dyn Fn() + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&TransportError) + Send + Sync>;
type ListenerFn = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

/// Lifecycle callbacks for one stream connection.
///
/// Only the first subscriber to an endpoint supplies the options; later
/// subscribers share the existing connection and their options are ignored.
#[derive(Clone, Default)]
pub struct StreamOptions {
    pub on_open: Option<Callback>,
    pub on_error: Option<ErrorCallback>,
    pub on_complete: Option<Callback>,
}

impl StreamOptions {
    /// Sets the callback invoked when the transport opens.
    pub fn on_open(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(callback));
        self
    }

    /// Sets the callback invoked on transport errors. The transport keeps
    /// its native reconnection behavior, so most errors do not close the
    /// connection; a server-ended stream is the exception and closes it
    /// after the callback fires.
    pub fn on_error(
        mut self,
        callback: impl Fn(&TransportError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Sets the callback invoked when the server signals completion.
    pub fn on_complete(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOptions")
            .field("on_open", &self.on_open.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Ordered listener collection. Listeners fire once per event in
/// registration order; removal is by the id handed out at registration, so
/// duplicate callbacks are independent entries.
#[derive(Default)]
pub(crate) struct ListenerSet {
    entries: Mutex<Vec<(u64, ListenerFn)>>,
    next_id: AtomicU64,
}

impl ListenerSet {
    fn add(&self, listener: ListenerFn) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_entries().push((id, listener));
        id
    }

    fn remove(&self, id: u64) {
        self.lock_entries().retain(|(entry_id, _)| *entry_id != id);
    }

    fn dispatch(&self, event: &StreamEvent) {
        // Snapshot under the lock, invoke outside it so a listener may
        // register or remove listeners without deadlocking.
        let listeners: Vec<ListenerFn> = self
            .lock_entries()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    fn len(&self) -> usize {
        self.lock_entries().len()
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, Vec<(u64, ListenerFn)>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle for removing one registered listener.
///
/// Dropping the guard does not detach the listener; only an explicit
/// [`ListenerGuard::unsubscribe`] does. Unsubscribing never affects the
/// connection or other listeners.
pub struct ListenerGuard {
    id: u64,
    listeners: Weak<ListenerSet>,
}

impl ListenerGuard {
    /// Removes exactly the listener this guard was returned for.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.remove(self.id);
        }
    }
}

/// One live SSE connection shared by all subscribers to its URL.
pub struct StreamConnection {
    url: String,
    options: StreamOptions,
    http: Client,
    credentials: CredentialStore,
    listeners: Arc<ListenerSet>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConnection {
    pub(crate) fn new(
        http: Client,
        url: String,
        options: StreamOptions,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            url,
            options,
            http,
            credentials,
            listeners: Arc::new(ListenerSet::default()),
            worker: Mutex::new(None),
        }
    }

    /// Opens the transport, tearing down any previous one on this instance
    /// first. Must be called from within a tokio runtime.
    pub fn connect(&self) {
        self.shutdown_worker();

        let token = self
            .credentials
            .snapshot()
            .access_token
            .map(|token| token.expose_secret().clone());
        let url = authenticated_url(&self.url, token.as_deref());
        let request = self.http.get(url).header(ACCEPT, "text/event-stream");
        let options = self.options.clone();
        let listeners = Arc::clone(&self.listeners);

        let handle = tokio::spawn(async move {
            run_event_loop(request, options, listeners).await;
        });
        *self.lock_worker() = Some(handle);
    }

    /// Closes the transport. Safe to call repeatedly; a no-op when already
    /// closed.
    pub fn disconnect(&self) {
        self.shutdown_worker();
    }

    /// True while the background transport task is alive.
    pub fn is_connected(&self) -> bool {
        self.lock_worker()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Registers a listener invoked once per inbound event, after all
    /// previously registered listeners.
    pub fn add_listener(
        &self,
        listener: impl Fn(&StreamEvent) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.listeners.add(Arc::new(listener));
        ListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn shutdown_worker(&self) {
        if let Some(handle) = self.lock_worker().take() {
            handle.abort();
        }
    }

    fn lock_worker(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for StreamConnection {
    fn drop(&mut self) {
        self.shutdown_worker();
    }
}

async fn run_event_loop(
    request: reqwest::RequestBuilder,
    options: StreamOptions,
    listeners: Arc<ListenerSet>,
) {
    let mut source = match EventSource::new(request) {
        Ok(source) => source,
        Err(err) => {
            error!(event = "stream_connect_failed", error = %err);
            return;
        }
    };

    while let Some(next) = source.next().await {
        match next {
            Ok(Event::Open) => {
                if let Some(on_open) = &options.on_open {
                    on_open();
                }
            }
            Ok(Event::Message(message)) => {
                if message.event == COMPLETE_EVENT {
                    if let Some(on_complete) = &options.on_complete {
                        on_complete();
                    }
                    source.close();
                    return;
                }

                match serde_json::from_str(&message.data) {
                    Ok(data) => {
                        let event = StreamEvent {
                            event: message.event,
                            data,
                            id: (!message.id.is_empty()).then(|| message.id.clone()),
                            retry: message.retry,
                        };
                        listeners.dispatch(&event);
                    }
                    Err(err) => {
                        // Malformed frames are dropped at the source and
                        // never reach listeners.
                        warn!(event = "malformed_stream_frame", error = %err);
                    }
                }
            }
            Err(err @ TransportError::StreamEnded) => {
                // Server closed without a completion event. The transport
                // will not reopen, so subscribers hear about it.
                if let Some(on_error) = &options.on_error {
                    on_error(&err);
                }
                return;
            }
            Err(err) => {
                // The event source reconnects on its own; surface the error
                // and keep polling.
                if let Some(on_error) = &options.on_error {
                    on_error(&err);
                }
            }
        }
    }
}

/// Appends the access token as a `token` query parameter, respecting any
/// existing query string.
fn authenticated_url(url: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{url}{separator}token={token}")
        }
        None => url.to_string(),
    }
}
