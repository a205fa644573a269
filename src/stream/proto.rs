use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parsed server-sent event delivered to every registered listener.
#[derive(Clone, Debug)]
pub struct StreamEvent {
    /// Event name from the frame; plain message frames carry `message`.
    pub event: String,
    /// JSON payload of the frame.
    pub data: Value,
    /// Last event id, when the server set one.
    pub id: Option<String>,
    /// Server-suggested reconnection delay, when present.
    pub retry: Option<Duration>,
}

impl StreamEvent {
    /// Decodes the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Chat room message pushed on `/chat/rooms/{id}/stream`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender: String,
    pub timestamp: String,
}

/// Incremental AI generation output pushed on `/ai/generate`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AiGenerationChunk {
    pub id: String,
    pub chunk: String,
    pub is_complete: bool,
}

/// Severity of a pushed notification.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Notification pushed on `/notifications/stream`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub level: NotificationLevel,
    pub title: String,
    pub message: String,
    pub timestamp: String,
}
