//! Telegram transport: long-polls the Bot API and posts to the destination.
//!
//! The Bot API allows a single `getUpdates` consumer per token, so one
//! shared poller fans updates out to per-source subscriptions by chat id.
//! A poll failure disconnects every subscription; the first resubscribe
//! restarts the poller from the last confirmed offset. Updates for a
//! registered chat that is between subscriptions are held and handed to its
//! next subscription, since the offset has already moved past them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ConfigError, SendError, TransportError};
use crate::pipeline::types::{
    Ack, Destination, InboundMessage, Source, SourceEvent, SourceStream, Transport,
};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Events held per unsubscribed chat before the oldest are dropped.
const MAX_PENDING_PER_CHAT: usize = 1000;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Bot API connection settings.
#[derive(Debug)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    /// Bot API base URL (overridable for self-hosted API servers).
    pub api_base: String,
    /// Long-poll timeout passed to `getUpdates`.
    pub poll_timeout_secs: u64,
}

impl TelegramConfig {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: DEFAULT_API_BASE.to_string(),
            poll_timeout_secs: 30,
        }
    }

    /// Read `TELEGRAM_BOT_TOKEN` (required), `TELEGRAM_API_BASE` and
    /// `TELEGRAM_POLL_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        let api_base = std::env::var("TELEGRAM_API_BASE")
            .unwrap_or_else(|_| DEFAULT_API_BASE.to_string());

        let poll_timeout_secs: u64 = std::env::var("TELEGRAM_POLL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            bot_token: SecretString::from(token),
            api_base: api_base.trim_end_matches('/').to_string(),
            poll_timeout_secs,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }
}

/// Live subscriptions plus updates held for registered chats.
#[derive(Default)]
struct RouteTable {
    routes: HashMap<String, mpsc::UnboundedSender<SourceEvent>>,
    registered: HashSet<String>,
    pending: HashMap<String, VecDeque<SourceEvent>>,
}

impl RouteTable {
    /// Install a subscription, first flushing anything held for the chat.
    fn attach(&mut self, chat_id: &str, tx: mpsc::UnboundedSender<SourceEvent>) -> usize {
        let held = self.pending.remove(chat_id).unwrap_or_default();
        let flushed = held.len();
        for event in held {
            let _ = tx.send(event);
        }
        if self.routes.insert(chat_id.to_string(), tx).is_some() {
            tracing::debug!(chat_id, "Replaced existing Telegram subscription");
        }
        flushed
    }

    fn deliver(&mut self, chat_id: String, mut event: SourceEvent) {
        if let Some(tx) = self.routes.get(&chat_id) {
            match tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => event = returned,
            }
            self.routes.remove(&chat_id);
        }

        if !self.registered.contains(&chat_id) {
            tracing::debug!(chat_id = %chat_id, "Update from unregistered chat");
            return;
        }

        let held = self.pending.entry(chat_id).or_default();
        if held.len() == MAX_PENDING_PER_CHAT {
            held.pop_front();
            tracing::warn!("Held update buffer full, dropping oldest");
        }
        held.push_back(event);
    }

    /// Send `Disconnected` to every subscription and forget them.
    fn disconnect_all(&mut self, reason: &str) {
        for (_, tx) in self.routes.drain() {
            let _ = tx.send(SourceEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Drop closed subscriptions; true if any remain.
    fn prune(&mut self) -> bool {
        self.routes.retain(|_, tx| !tx.is_closed());
        !self.routes.is_empty()
    }
}

type Routes = Arc<Mutex<RouteTable>>;

fn lock_routes(routes: &Routes) -> MutexGuard<'_, RouteTable> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Telegram Bot API transport.
pub struct TelegramTransport {
    config: Arc<TelegramConfig>,
    client: reqwest::Client,
    routes: Routes,
    /// Next `getUpdates` offset; survives poller restarts.
    offset: Arc<AtomicI64>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.poll_timeout_secs + 15))
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(Self {
            config: Arc::new(config),
            client,
            routes: Arc::new(Mutex::new(RouteTable::default())),
            offset: Arc::new(AtomicI64::new(0)),
            poller: Mutex::new(None),
        })
    }

    /// Start the shared poller unless one is already running.
    fn ensure_poller(&self) {
        let mut poller = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let client = self.client.clone();
        let config = Arc::clone(&self.config);
        let routes = Arc::clone(&self.routes);
        let offset = Arc::clone(&self.offset);
        *poller = Some(tokio::spawn(poll_updates(client, config, routes, offset)));
    }

    /// Send a single message chunk (≤4096 chars).
    async fn send_chunk(&self, destination: &Destination, text: &str) -> Result<String, SendError> {
        let mut body = serde_json::json!({
            "chat_id": destination.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(topic_id) = destination.topic_id {
            body["message_thread_id"] = Value::from(topic_id);
        }

        let resp = self
            .client
            .post(self.config.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::transient(format!("sendMessage request failed: {e}")))?;

        let status = resp.status();
        let data: Value = resp.json().await.unwrap_or(Value::Null);

        if status.is_success() && data.get("ok").and_then(Value::as_bool) == Some(true) {
            let id = data
                .get("result")
                .and_then(|r| r.get("message_id"))
                .and_then(Value::as_i64)
                .map(|id| id.to_string())
                .unwrap_or_default();
            return Ok(id);
        }

        Err(classify_failure(status.as_u16(), &data))
    }
}

impl Drop for TelegramTransport {
    fn drop(&mut self) {
        if let Ok(mut poller) = self.poller.lock() {
            if let Some(handle) = poller.take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn name(&self) -> &str {
        "telegram"
    }

    fn register_sources(&self, sources: &[Source]) {
        lock_routes(&self.routes)
            .registered
            .extend(sources.iter().map(|s| s.id.clone()));
    }

    async fn subscribe(&self, source: &Source) -> Result<SourceStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let flushed = {
            let mut table = lock_routes(&self.routes);
            table.registered.insert(source.id.clone());
            table.attach(&source.id, tx)
        };
        self.ensure_poller();
        tracing::info!(
            source = %source.id,
            name = %source.name,
            held = flushed,
            "Subscribed to Telegram chat"
        );

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send_to_destination(
        &self,
        destination: &Destination,
        text: &str,
    ) -> Result<Ack, SendError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let mut message_ids = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            message_ids.push(self.send_chunk(destination, chunk).await?);
        }
        Ok(Ack { message_ids })
    }
}

// ── Polling ─────────────────────────────────────────────────────────

async fn poll_updates(
    client: reqwest::Client,
    config: Arc<TelegramConfig>,
    routes: Routes,
    offset: Arc<AtomicI64>,
) {
    tracing::info!("Telegram poller listening for updates...");

    loop {
        if !lock_routes(&routes).prune() {
            tracing::info!("No Telegram subscriptions left, poller stopping");
            return;
        }

        let updates = match fetch_updates(&client, &config, offset.load(Ordering::SeqCst)).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = %e, "Telegram poll failed, disconnecting subscriptions");
                lock_routes(&routes).disconnect_all(&e.to_string());
                return;
            }
        };

        let mut table = lock_routes(&routes);
        for update in &updates {
            // Advance offset past this update
            if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                offset.store(uid + 1, Ordering::SeqCst);
            }

            if let Some((chat_id, event)) = parse_update(update) {
                table.deliver(chat_id, event);
            }
        }
    }
}

async fn fetch_updates(
    client: &reqwest::Client,
    config: &TelegramConfig,
    offset: i64,
) -> Result<Vec<Value>, TransportError> {
    let body = serde_json::json!({
        "offset": offset,
        "timeout": config.poll_timeout_secs,
        "allowed_updates": ["message", "channel_post"]
    });

    let resp = client
        .post(config.api_url("getUpdates"))
        .json(&body)
        .send()
        .await
        .map_err(|e| TransportError::Http(format!("getUpdates request failed: {e}")))?;

    let status = resp.status();
    let data: Value = resp
        .json()
        .await
        .map_err(|e| TransportError::Http(format!("getUpdates returned invalid JSON: {e}")))?;

    if !status.is_success() || data.get("ok").and_then(Value::as_bool) != Some(true) {
        let description = data
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("no description");
        return Err(TransportError::Http(format!(
            "getUpdates failed ({status}): {description}"
        )));
    }

    Ok(data
        .get("result")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Turn one update into `(chat id, event)`.
///
/// Returns `None` for update kinds the relay ignores and for updates that
/// carry no chat to route by.
pub fn parse_update(update: &Value) -> Option<(String, SourceEvent)> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;

    let chat = message.get("chat");
    let Some(chat_id) = chat.and_then(|c| c.get("id")).and_then(Value::as_i64) else {
        tracing::debug!("Telegram update without chat id, ignoring");
        return None;
    };
    let chat_id = chat_id.to_string();

    let Some(message_id) = message.get("message_id").and_then(Value::as_i64) else {
        return Some((
            chat_id,
            SourceEvent::Malformed {
                reason: "message has no message_id".into(),
            },
        ));
    };

    let Some(text) = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(Value::as_str)
    else {
        return Some((
            chat_id,
            SourceEvent::Malformed {
                reason: format!("message {message_id} has no text or caption"),
            },
        ));
    };

    let mut inbound = InboundMessage::new(&chat_id, message_id.to_string(), text);

    if let Some(date) = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
    {
        inbound = inbound.with_timestamp(date);
    }

    let sender = message
        .get("from")
        .and_then(|f| f.get("username").or_else(|| f.get("first_name")))
        .or_else(|| message.get("author_signature"))
        .and_then(Value::as_str);
    if let Some(sender) = sender {
        inbound = inbound.with_sender(sender);
    }

    if let Some(title) = chat.and_then(|c| c.get("title")).and_then(Value::as_str) {
        inbound = inbound.with_chat_title(title);
    }

    Some((chat_id, SourceEvent::Message(inbound)))
}

/// Map a failed Bot API response to a send outcome.
///
/// 429 carries `parameters.retry_after`; 5xx is transient; other errors
/// (bad chat, missing rights, bad topic) will not succeed on retry.
fn classify_failure(status: u16, body: &Value) -> SendError {
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description")
        .to_string();
    let reason = format!("sendMessage returned {status}: {description}");

    match status {
        429 => {
            let retry_after = body
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(Value::as_u64)
                .unwrap_or(1);
            SendError::rate_limited(reason, Duration::from_secs(retry_after))
        }
        500..=599 => SendError::transient(reason),
        _ => SendError::fatal(reason),
    }
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        // Find a good split point
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
