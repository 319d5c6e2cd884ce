//! Pipeline coordinator: one worker task per source.
//!
//! Each worker owns its source's connection state machine and consumes that
//! source's events strictly in order. Workers for different sources run
//! concurrently and share the ledger, dispatcher and stats through `Arc`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::DeliveryError;
use crate::pipeline::connection::{ConnectionState, ReconnectPolicy, SourceConnection};
use crate::pipeline::dedup::DedupLedger;
use crate::pipeline::dispatcher::Dispatcher;
use crate::pipeline::filter::FilterEngine;
use crate::pipeline::stats::{RelayStats, StatsSnapshot};
use crate::pipeline::transform::TextTransformer;
use crate::pipeline::types::{
    Destination, InboundMessage, Source, SourceEvent, SourceStream, Transport,
};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};

/// What happened to one inbound message.
#[derive(Debug)]
pub enum ProcessOutcome {
    Forwarded,
    FilteredOut,
    Duplicate,
    Failed(DeliveryError),
}

// ── Shared per-message pipeline ─────────────────────────────────────

/// Filter → transform → dedup → dispatch for a single message.
pub struct Pipeline {
    destination: Destination,
    filter: FilterEngine,
    transformer: TextTransformer,
    ledger: Arc<DedupLedger>,
    dispatcher: Arc<Dispatcher>,
    stats: Arc<RelayStats>,
}

impl Pipeline {
    /// Build the pipeline stages from a validated config.
    pub fn from_config(
        config: &RelayConfig,
        transport: Arc<dyn Transport>,
        shutdown: Shutdown,
    ) -> Self {
        let filter = if config.filtering_enabled {
            FilterEngine::new(config.filter_rules.clone())
        } else {
            FilterEngine::pass_through()
        };

        let mut ledger = DedupLedger::new(config.dedup_retention);
        if let Some(max) = config.dedup_max_entries {
            ledger = ledger.with_max_entries(max);
        }

        let dispatcher = Dispatcher::new(transport, config.retry.clone(), shutdown)
            .with_min_send_interval(config.min_send_interval);

        let stats = RelayStats::new();
        for source in &config.sources {
            stats.register_source(&source.id, &source.name);
        }

        Self {
            destination: config.destination.clone(),
            filter,
            transformer: TextTransformer::new(config.replacements.clone()),
            ledger: Arc::new(ledger),
            dispatcher: Arc::new(dispatcher),
            stats: Arc::new(stats),
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    pub fn ledger(&self) -> &Arc<DedupLedger> {
        &self.ledger
    }

    /// Run one message through every stage.
    ///
    /// The ledger record is taken before sending and given back if the send
    /// does not complete, so a record always means a delivered message.
    pub async fn process(&self, message: InboundMessage) -> ProcessOutcome {
        self.stats.record_received();

        let verdict = self.filter.evaluate(&message);
        if !verdict.is_match() {
            self.stats.record_filtered_out();
            return ProcessOutcome::FilteredOut;
        }

        let outbound = self.transformer.transform(&message, &self.destination);

        let Some(admission) = Admission::admit(&self.ledger, &message, Utc::now()) else {
            debug!(
                source = %message.source_id,
                id = %message.message_id,
                "Already forwarded, skipping"
            );
            self.stats.record_duplicate();
            return ProcessOutcome::Duplicate;
        };

        match self.dispatcher.send(&outbound).await {
            Ok(ack) => {
                admission.commit();
                self.stats.record_forwarded(&message.source_id);
                info!(
                    source = %message.source_id,
                    id = %message.message_id,
                    rule = verdict.label(),
                    posted = ack.message_ids.len(),
                    "Forwarded message"
                );
                ProcessOutcome::Forwarded
            }
            Err(e) => {
                drop(admission);
                self.stats.record_failed();
                error!(
                    source = %message.source_id,
                    id = %message.message_id,
                    error = %e,
                    "Delivery failed, message dropped"
                );
                ProcessOutcome::Failed(e)
            }
        }
    }
}

/// A ledger record that is released on drop unless committed.
struct Admission<'a> {
    ledger: &'a DedupLedger,
    source_id: &'a str,
    message_id: &'a str,
    committed: bool,
}

impl<'a> Admission<'a> {
    fn admit(
        ledger: &'a DedupLedger,
        message: &'a InboundMessage,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        ledger
            .admit(&message.source_id, &message.message_id, now)
            .then(|| Self {
                ledger,
                source_id: &message.source_id,
                message_id: &message.message_id,
                committed: false,
            })
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.ledger.release(self.source_id, self.message_id);
        }
    }
}

// ── Source worker ───────────────────────────────────────────────────

enum StreamEnd {
    /// Transport reported a dropped connection.
    Disconnected(String),
    /// The stream returned `None`.
    Finished,
    Shutdown,
}

struct SourceWorker {
    source: Source,
    transport: Arc<dyn Transport>,
    pipeline: Arc<Pipeline>,
    reconnect: ReconnectPolicy,
    connection: SourceConnection,
    shutdown: Shutdown,
}

impl SourceWorker {
    async fn run(mut self) {
        info!(source = %self.source.id, name = %self.source.name, "Source worker started");
        let mut connects: u64 = 0;

        loop {
            if self.shutdown.is_triggered() {
                break;
            }

            if connects > 0 {
                self.pipeline.stats.record_reconnect(&self.source.id);
            }
            connects += 1;
            self.set_state(ConnectionState::Connecting, None);

            let subscribed = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                result = self.transport.subscribe(&self.source) => result,
            };

            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(source = %self.source.id, error = %e, "Subscribe failed");
                    self.set_state(ConnectionState::Disconnected, Some(e.to_string()));
                    if !self.backoff().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::Streaming, None);
            info!(source = %self.source.id, "Streaming");

            let end = self.consume(&mut stream).await;
            drop(stream);

            match end {
                StreamEnd::Shutdown => break,
                StreamEnd::Finished => {
                    info!(source = %self.source.id, "Source stream ended");
                    self.set_state(ConnectionState::Disconnected, Some("end of stream".into()));
                    break;
                }
                StreamEnd::Disconnected(reason) => {
                    warn!(source = %self.source.id, reason = %reason, "Source disconnected");
                    self.set_state(ConnectionState::Disconnected, Some(reason));
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        if self.connection.state() != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected, Some("shutdown".into()));
        }
        info!(source = %self.source.id, "Source worker stopped");
    }

    /// Consume events in arrival order until the stream stops.
    async fn consume(&mut self, stream: &mut SourceStream) -> StreamEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shutdown.wait() => return StreamEnd::Shutdown,
                event = stream.next() => event,
            };

            match event {
                None => return StreamEnd::Finished,
                Some(SourceEvent::Disconnected { reason }) => {
                    return StreamEnd::Disconnected(reason);
                }
                Some(SourceEvent::Malformed { reason }) => {
                    warn!(source = %self.source.id, reason = %reason, "Skipping malformed event");
                    self.pipeline.stats.record_malformed();
                }
                Some(SourceEvent::Message(message)) => {
                    if message.source_id != self.source.id {
                        warn!(
                            source = %self.source.id,
                            got = %message.source_id,
                            "Dropping message from unconfigured chat"
                        );
                        continue;
                    }
                    self.pipeline.process(message).await;
                }
            }
        }
    }

    /// Wait before reconnecting. Returns `false` if shutdown interrupted.
    async fn backoff(&mut self) -> bool {
        let delay = self.reconnect.delay_for(self.connection.failures());
        info!(
            source = %self.source.id,
            failures = self.connection.failures(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting after backoff"
        );
        self.shutdown.sleep(delay).await
    }

    fn set_state(&mut self, state: ConnectionState, reason: Option<String>) {
        if let Err(e) = self.connection.transition_to(state, reason) {
            warn!(source = %self.source.id, error = %e, "Invalid connection transition");
            return;
        }
        self.pipeline.stats.record_state(&self.source.id, state);
    }
}

// ── Relay ───────────────────────────────────────────────────────────

/// The assembled relay, ready to spawn its workers.
pub struct Relay {
    sources: Vec<Source>,
    transport: Arc<dyn Transport>,
    pipeline: Arc<Pipeline>,
    reconnect: ReconnectPolicy,
    grace: Duration,
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
}

impl Relay {
    pub fn new(config: RelayConfig, transport: Arc<dyn Transport>) -> Self {
        let (trigger, shutdown) = shutdown::channel();
        let pipeline = Pipeline::from_config(&config, Arc::clone(&transport), shutdown.clone());
        Self {
            sources: config.sources,
            transport,
            pipeline: Arc::new(pipeline),
            reconnect: config.reconnect,
            grace: config.shutdown_grace,
            trigger,
            shutdown,
        }
    }

    /// Build the relay and spawn one worker per source.
    pub fn start(config: RelayConfig, transport: Arc<dyn Transport>) -> RelayHandle {
        Self::new(config, transport).spawn()
    }

    /// Run until `signal` resolves, then shut down gracefully.
    pub async fn run_until<F>(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        signal: F,
    ) -> ShutdownReport
    where
        F: Future<Output = ()>,
    {
        let handle = Self::start(config, transport);
        signal.await;
        info!("Shutdown signal received");
        handle.shutdown().await
    }

    pub fn spawn(self) -> RelayHandle {
        info!(
            transport = self.transport.name(),
            sources = self.sources.len(),
            destination = %self.pipeline.destination,
            "Starting relay"
        );
        self.transport.register_sources(&self.sources);

        let workers = self
            .sources
            .into_iter()
            .map(|source| {
                let id = source.id.clone();
                let worker = SourceWorker {
                    connection: SourceConnection::new(&source.id),
                    source,
                    transport: Arc::clone(&self.transport),
                    pipeline: Arc::clone(&self.pipeline),
                    reconnect: self.reconnect.clone(),
                    shutdown: self.shutdown.clone(),
                };
                (id, tokio::spawn(worker.run()))
            })
            .collect();

        RelayHandle {
            trigger: self.trigger,
            shutdown: self.shutdown,
            workers,
            grace: self.grace,
            pipeline: self.pipeline,
        }
    }
}

/// Summary of a graceful shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    /// Workers that stopped within the grace period.
    pub completed: usize,
    /// Workers aborted after the grace period (or that panicked).
    pub aborted: usize,
    pub stats: StatsSnapshot,
}

/// Handle to a running relay.
pub struct RelayHandle {
    trigger: ShutdownTrigger,
    shutdown: Shutdown,
    workers: Vec<(String, JoinHandle<()>)>,
    grace: Duration,
    pipeline: Arc<Pipeline>,
}

impl RelayHandle {
    pub fn stats(&self) -> Arc<RelayStats> {
        Arc::clone(&self.pipeline.stats)
    }

    pub fn ledger(&self) -> Arc<DedupLedger> {
        Arc::clone(&self.pipeline.ledger)
    }

    /// A receiver for the relay's shutdown signal (for sibling tasks).
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// True once every worker has exited on its own.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|(_, handle)| handle.is_finished())
    }

    /// Signal shutdown and wait up to the grace period for workers to stop.
    pub async fn shutdown(self) -> ShutdownReport {
        self.trigger.trigger();
        let deadline = Instant::now() + self.grace;
        let mut completed = 0;
        let mut aborted = 0;

        for (source_id, mut handle) in self.workers {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => completed += 1,
                Ok(Err(e)) => {
                    error!(source = %source_id, error = %e, "Source worker failed");
                    aborted += 1;
                }
                Err(_) => {
                    warn!(source = %source_id, "Grace period elapsed, aborting worker");
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        let stats = self.pipeline.stats.snapshot();
        info!(
            completed,
            aborted,
            forwarded = stats.forwarded,
            failed = stats.failed,
            "Relay stopped"
        );
        ShutdownReport {
            completed,
            aborted,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SendError, TransportError};
    use crate::pipeline::dispatcher::RetryPolicy;
    use crate::pipeline::rules::{FilterRule, MatchMode};
    use crate::pipeline::types::Ack;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    /// Hands out pre-made event streams and records sent texts.
    #[derive(Default)]
    struct ChannelTransport {
        streams: Mutex<HashMap<String, Vec<SourceStream>>>,
        sent: Mutex<Vec<String>>,
        fail_sends: bool,
    }

    impl ChannelTransport {
        fn feed(&self, source_id: &str) -> mpsc::UnboundedSender<SourceEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.streams
                .lock()
                .unwrap()
                .entry(source_id.to_string())
                .or_default()
                .push(Box::pin(UnboundedReceiverStream::new(rx)));
            tx
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        fn name(&self) -> &str {
            "channel"
        }

        async fn subscribe(&self, source: &Source) -> Result<SourceStream, TransportError> {
            let mut streams = self.streams.lock().unwrap();
            match streams.get_mut(&source.id) {
                Some(queue) if !queue.is_empty() => Ok(queue.remove(0)),
                _ => Err(TransportError::SubscribeFailed {
                    source_id: source.id.clone(),
                    reason: "no stream queued".into(),
                }),
            }
        }

        async fn send_to_destination(
            &self,
            _destination: &Destination,
            text: &str,
        ) -> Result<Ack, SendError> {
            if self.fail_sends {
                return Err(SendError::fatal("chat not found"));
            }
            let mut sent = self.sent.lock().unwrap();
            sent.push(text.to_string());
            Ok(Ack {
                message_ids: vec![sent.len().to_string()],
            })
        }
    }

    fn config() -> RelayConfig {
        let mut config = RelayConfig::new(
            vec![Source::new("a", "Group A")],
            Destination::chat("dest"),
        );
        config.filter_rules =
            vec![FilterRule::new("rain", vec![vec!["rain".into()]], MatchMode::Any, false).unwrap()];
        config.min_send_interval = Duration::ZERO;
        config.retry = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
        };
        config.reconnect = ReconnectPolicy {
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
        };
        config.shutdown_grace = Duration::from_secs(2);
        config
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn process_outcomes() {
        let transport = Arc::new(ChannelTransport::default());
        let pipeline = Pipeline::from_config(&config(), transport.clone(), Shutdown::never());

        assert!(matches!(
            pipeline.process(InboundMessage::new("a", "1", "Rain today")).await,
            ProcessOutcome::Forwarded
        ));
        assert!(matches!(
            pipeline.process(InboundMessage::new("a", "1", "Rain today")).await,
            ProcessOutcome::Duplicate
        ));
        assert!(matches!(
            pipeline.process(InboundMessage::new("a", "2", "Sunny")).await,
            ProcessOutcome::FilteredOut
        ));
        assert_eq!(transport.sent(), vec!["Rain today"]);

        let snap = pipeline.stats().snapshot();
        assert_eq!(snap.received, 3);
        assert_eq!(snap.forwarded, 1);
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.filtered_out, 1);
    }

    #[tokio::test]
    async fn failed_delivery_releases_ledger_record() {
        let transport = Arc::new(ChannelTransport {
            fail_sends: true,
            ..Default::default()
        });
        let pipeline = Pipeline::from_config(&config(), transport, Shutdown::never());

        let outcome = pipeline.process(InboundMessage::new("a", "1", "rain")).await;
        assert!(matches!(outcome, ProcessOutcome::Failed(DeliveryError::Rejected { .. })));
        assert!(!pipeline.ledger().contains("a", "1"));
        assert_eq!(pipeline.stats().snapshot().failed, 1);
    }

    #[tokio::test]
    async fn worker_reconnects_after_disconnect() {
        let transport = Arc::new(ChannelTransport::default());
        let first = transport.feed("a");
        let second = transport.feed("a");

        let handle = Relay::start(config(), transport.clone());

        first
            .send(SourceEvent::Message(InboundMessage::new("a", "1", "rain 1")))
            .unwrap();
        first
            .send(SourceEvent::Disconnected {
                reason: "reset".into(),
            })
            .unwrap();
        // Replayed after reconnect; must not be sent twice.
        second
            .send(SourceEvent::Message(InboundMessage::new("a", "1", "rain 1")))
            .unwrap();
        second
            .send(SourceEvent::Message(InboundMessage::new("a", "2", "rain 2")))
            .unwrap();

        wait_for(|| transport.sent().len() == 2).await;
        let stats = handle.stats();
        wait_for(|| stats.snapshot().duplicates == 1).await;

        let report = handle.shutdown().await;
        assert_eq!(transport.sent(), vec!["rain 1", "rain 2"]);
        assert_eq!(report.completed, 1);
        assert_eq!(report.aborted, 0);
        assert_eq!(report.stats.sources["a"].reconnects, 1);
        assert_eq!(report.stats.sources["a"].state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn end_of_stream_stops_worker() {
        let transport = Arc::new(ChannelTransport::default());
        let feed = transport.feed("a");

        let handle = Relay::start(config(), transport.clone());
        feed.send(SourceEvent::Malformed {
            reason: "no text".into(),
        })
        .unwrap();
        drop(feed);

        wait_for(|| handle.is_finished()).await;
        let report = handle.shutdown().await;
        assert_eq!(report.stats.malformed, 1);
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn foreign_chat_messages_are_dropped() {
        let transport = Arc::new(ChannelTransport::default());
        let feed = transport.feed("a");

        let handle = Relay::start(config(), transport.clone());
        feed.send(SourceEvent::Message(InboundMessage::new("zzz", "1", "rain")))
            .unwrap();
        feed.send(SourceEvent::Message(InboundMessage::new("a", "2", "rain")))
            .unwrap();

        wait_for(|| transport.sent().len() == 1).await;
        let report = handle.shutdown().await;
        assert_eq!(report.stats.received, 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_reconnect_backoff() {
        let transport = Arc::new(ChannelTransport::default());
        let mut config = config();
        config.reconnect = ReconnectPolicy {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
        };

        // No stream queued: subscribe fails and the worker backs off for a minute.
        let handle = Relay::start(config, transport);
        let stats = handle.stats();
        wait_for(|| {
            stats
                .snapshot()
                .sources
                .get("a")
                .is_some_and(|s| s.state == ConnectionState::Disconnected)
                && handle.workers.iter().all(|(_, h)| !h.is_finished())
        })
        .await;

        let started = Instant::now();
        let report = handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.completed, 1);
    }
}
