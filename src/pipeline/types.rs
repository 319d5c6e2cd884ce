//! Shared types for the relay pipeline.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{SendError, TransportError};

// ── Sources and destination ─────────────────────────────────────────

/// An upstream feed being monitored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    /// Platform chat identifier (e.g. "-1001234567890").
    pub id: String,
    /// Human-readable name used in logs.
    pub name: String,
}

impl Source {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// The single output chat (and optional forum topic) receiving forwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Target chat identifier.
    pub chat_id: String,
    /// Forum topic (message thread) id, if the target is a forum group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<i64>,
    /// Display name of the topic, for logs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_name: Option<String>,
}

impl Destination {
    pub fn chat(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            topic_id: None,
            topic_name: None,
        }
    }

    pub fn with_topic(mut self, topic_id: i64, topic_name: Option<String>) -> Self {
        self.topic_id = Some(topic_id);
        self.topic_name = topic_name;
        self
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.topic_id, &self.topic_name) {
            (Some(id), Some(name)) => write!(f, "{}#{} ({})", self.chat_id, id, name),
            (Some(id), None) => write!(f, "{}#{}", self.chat_id, id),
            _ => write!(f, "{}", self.chat_id),
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

/// Identity of an inbound message: (source id, native message id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub source_id: String,
    pub message_id: String,
}

impl MessageRef {
    pub fn new(source_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            message_id: message_id.into(),
        }
    }
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.message_id)
    }
}

/// A message received from a source feed.
///
/// Transport adapters convert their native update format into this struct.
/// It is never mutated once the pipeline has it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Source (chat) the message arrived from.
    pub source_id: String,
    /// Platform-native message id, unique within the source.
    pub message_id: String,
    /// When the message was posted.
    pub timestamp: DateTime<Utc>,
    /// Message body (text or media caption). May be empty.
    pub text: String,
    /// Sender display name or handle, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    /// Title of the originating chat, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_title: Option<String>,
}

impl InboundMessage {
    pub fn new(
        source_id: impl Into<String>,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            message_id: message_id.into(),
            timestamp: Utc::now(),
            text: text.into(),
            sender: None,
            chat_title: None,
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_chat_title(mut self, title: impl Into<String>) -> Self {
        self.chat_title = Some(title.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn message_ref(&self) -> MessageRef {
        MessageRef::new(&self.source_id, &self.message_id)
    }
}

/// The rewritten payload headed for the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMessage {
    pub destination: Destination,
    pub text: String,
    /// Which inbound message this was derived from.
    pub origin: MessageRef,
}

/// Acknowledgement returned by the transport for a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    /// Platform ids of the posted message(s). Long texts may be split.
    pub message_ids: Vec<String>,
}

// ── Transport seam ──────────────────────────────────────────────────

/// One item from a source subscription.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// A well-formed message.
    Message(InboundMessage),
    /// An update that could not be turned into a message (missing fields).
    Malformed { reason: String },
    /// The connection dropped; the subscriber should reconnect.
    Disconnected { reason: String },
}

/// Stream of events for one source. `None` means the feed ended for good,
/// which is distinct from [`SourceEvent::Disconnected`].
pub type SourceStream = Pin<Box<dyn Stream<Item = SourceEvent> + Send>>;

/// The real-time messaging platform, as seen by the pipeline.
///
/// Adapters own connection setup and authentication. The pipeline only pulls
/// events and pushes text.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Announce every configured source before the first subscribe.
    ///
    /// Adapters that share one upstream connection across sources use this
    /// to hold events for sources that have not subscribed yet.
    fn register_sources(&self, _sources: &[Source]) {}

    /// Open an event stream for one source.
    async fn subscribe(&self, source: &Source) -> Result<SourceStream, TransportError>;

    /// Post text to the destination.
    async fn send_to_destination(
        &self,
        destination: &Destination,
        text: &str,
    ) -> Result<Ack, SendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_display_with_topic() {
        let dest = Destination::chat("-100999").with_topic(42, Some("Weather".into()));
        assert_eq!(dest.to_string(), "-100999#42 (Weather)");
        assert_eq!(Destination::chat("-100999").to_string(), "-100999");
    }

    #[test]
    fn message_ref_identity() {
        let msg = InboundMessage::new("-100123", "77", "hello").with_sender("alice");
        let r = msg.message_ref();
        assert_eq!(r, MessageRef::new("-100123", "77"));
        assert_eq!(r.to_string(), "-100123/77");
    }

    #[test]
    fn inbound_message_serialization_omits_none_fields() {
        let msg = InboundMessage::new("-1", "1", "text");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("sender").is_none());
        assert!(json.get("chat_title").is_none());
        assert_eq!(json["source_id"], "-1");
    }

    #[test]
    fn destination_deserializes_without_topic() {
        let dest: Destination = serde_json::from_str(r#"{"chat_id": "-100"}"#).unwrap();
        assert_eq!(dest.topic_id, None);
    }
}
