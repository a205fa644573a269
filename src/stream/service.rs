//! Convenience subscriptions for the platform's well-known stream endpoints.

use tracing::{debug, warn};

use crate::gateway::ApiClient;
use crate::stream::connection::StreamOptions;
use crate::stream::registry::Subscription;

/// Borrowed view over [`ApiClient`] exposing the streaming endpoints.
pub struct StreamService<'a> {
    client: &'a ApiClient,
}

impl ApiClient {
    /// Returns the streaming endpoint helpers.
    pub fn stream_service(&self) -> StreamService<'_> {
        StreamService { client: self }
    }
}

impl StreamService<'_> {
    /// Subscribes to a chat room stream. Lifecycle callbacks default to
    /// tracing log lines when the caller does not supply their own.
    pub fn subscribe_chat_room(&self, room_id: &str, options: StreamOptions) -> Subscription {
        let mut options = options;
        if options.on_open.is_none() {
            let room = room_id.to_string();
            options = options.on_open(move || debug!(event = "chat_stream_opened", room = %room));
        }
        if options.on_error.is_none() {
            options = options.on_error(|err| warn!(event = "chat_stream_error", error = %err));
        }
        if options.on_complete.is_none() {
            let room = room_id.to_string();
            options =
                options.on_complete(move || debug!(event = "chat_stream_completed", room = %room));
        }
        self.client
            .stream(&format!("/chat/rooms/{room_id}/stream"), options)
    }

    /// Subscribes to an AI generation stream.
    pub fn stream_ai_generation(&self, options: StreamOptions) -> Subscription {
        let mut options = options;
        if options.on_complete.is_none() {
            options = options.on_complete(|| debug!(event = "ai_generation_completed"));
        }
        self.client.stream("/ai/generate", options)
    }

    /// Subscribes to the notification stream.
    pub fn subscribe_notifications(&self, options: StreamOptions) -> Subscription {
        let mut options = options;
        if options.on_open.is_none() {
            options = options.on_open(|| debug!(event = "notification_stream_opened"));
        }
        self.client.stream("/notifications/stream", options)
    }

    /// Subscribes to a caller-supplied stream endpoint.
    pub fn subscribe_custom(&self, url: &str, options: StreamOptions) -> Subscription {
        self.client.stream(url, options)
    }

    /// Closes every active stream connection.
    pub fn disconnect_all(&self) {
        self.client.disconnect_all_streams();
    }
}
