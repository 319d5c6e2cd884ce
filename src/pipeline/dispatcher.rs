//! Dispatcher: delivers outbound messages with retry and backoff.
//!
//! Transient failures (rate limits, network errors) are retried with
//! exponential backoff plus jitter, up to `max_attempts`. A rate-limit
//! `retry_after` is honored as a minimum wait. Fatal failures are returned
//! immediately. Sends are serialized through one lock because there is a
//! single destination.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{DeliveryError, SendError};
use crate::pipeline::types::{Ack, OutboundMessage, Transport};
use crate::shutdown::Shutdown;

/// Retry/backoff parameters for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always >= 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after the given failed attempt (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Delay before the next attempt: jittered base, floored by `retry_after`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let delay = jitter(self.base_delay(attempt));
        match retry_after {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }
}

/// Equal jitter: half the base delay plus a random share of the other half.
fn jitter(base: Duration) -> Duration {
    let half = base / 2;
    let spread = half.as_millis() as u64;
    let extra = if spread == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=spread)
    };
    half + Duration::from_millis(extra)
}

/// Transient state of one delivery's retry sequence.
#[derive(Debug, Clone, Default)]
pub struct DeliveryAttempt {
    /// Attempts made so far.
    pub attempt: u32,
    /// Wait before the next attempt.
    pub next_delay: Duration,
    pub last_error: Option<SendError>,
}

impl DeliveryAttempt {
    fn record_failure(&mut self, error: SendError, next_delay: Duration) {
        self.last_error = Some(error);
        self.next_delay = next_delay;
    }
}

/// Sends outbound messages through the transport, one at a time.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    /// Minimum spacing between consecutive sends.
    min_send_interval: Duration,
    /// Serializes sends; holds the time of the last send.
    last_send: Mutex<Option<Instant>>,
    shutdown: Shutdown,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy, shutdown: Shutdown) -> Self {
        Self {
            transport,
            policy,
            min_send_interval: Duration::ZERO,
            last_send: Mutex::new(None),
            shutdown,
        }
    }

    /// Space consecutive sends at least `interval` apart.
    pub fn with_min_send_interval(mut self, interval: Duration) -> Self {
        self.min_send_interval = interval;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Deliver one message, retrying transient failures.
    ///
    /// Returns exactly one terminal outcome per call.
    pub async fn send(&self, message: &OutboundMessage) -> Result<Ack, DeliveryError> {
        let mut state = DeliveryAttempt::default();
        let mut shutdown = self.shutdown.clone();

        loop {
            state.attempt += 1;

            match self.send_once(message).await {
                Ok(ack) => {
                    info!(
                        origin = %message.origin,
                        destination = %message.destination,
                        attempt = state.attempt,
                        "Message delivered"
                    );
                    return Ok(ack);
                }
                Err(SendError::Fatal { reason }) => {
                    warn!(
                        origin = %message.origin,
                        reason = %reason,
                        "Destination rejected message, not retrying"
                    );
                    return Err(DeliveryError::Rejected {
                        message_ref: message.origin.to_string(),
                        reason,
                    });
                }
                Err(error) => {
                    if state.attempt >= self.policy.max_attempts {
                        return Err(DeliveryError::Exhausted {
                            message_ref: message.origin.to_string(),
                            attempts: state.attempt,
                            last_error: error,
                        });
                    }

                    let retry_after = match &error {
                        SendError::Transient { retry_after, .. } => *retry_after,
                        SendError::Fatal { .. } => None,
                    };
                    let delay = self.policy.delay_for(state.attempt, retry_after);
                    warn!(
                        origin = %message.origin,
                        attempt = state.attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient send failure, backing off"
                    );
                    state.record_failure(error, delay);

                    if !shutdown.sleep(state.next_delay).await {
                        return Err(DeliveryError::Cancelled {
                            message_ref: message.origin.to_string(),
                            attempts: state.attempt,
                        });
                    }
                }
            }
        }
    }

    /// One paced attempt under the send lock.
    async fn send_once(&self, message: &OutboundMessage) -> Result<Ack, SendError> {
        let mut last_send = self.last_send.lock().await;

        if let Some(last) = *last_send {
            let ready_at = last + self.min_send_interval;
            if ready_at > Instant::now() {
                debug!("Pacing send to respect minimum interval");
                tokio::time::sleep_until(ready_at).await;
            }
        }

        let result = self
            .transport
            .send_to_destination(&message.destination, &message.text)
            .await;
        *last_send = Some(Instant::now());
        result
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::TransportError;
    use crate::pipeline::types::{Destination, MessageRef, Source, SourceStream};
    use crate::shutdown;

    /// Transport that replays scripted send outcomes.
    struct ScriptedTransport {
        outcomes: StdMutex<VecDeque<Result<Ack, SendError>>>,
        sent: StdMutex<Vec<(String, Instant)>>,
    }

    impl ScriptedTransport {
        fn new(outcomes: Vec<Result<Ack, SendError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: StdMutex::new(outcomes.into()),
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn subscribe(&self, source: &Source) -> Result<SourceStream, TransportError> {
            Err(TransportError::SubscribeFailed {
                source_id: source.id.clone(),
                reason: "not supported".into(),
            })
        }

        async fn send_to_destination(
            &self,
            _destination: &Destination,
            text: &str,
        ) -> Result<Ack, SendError> {
            self.sent
                .lock()
                .unwrap()
                .push((text.to_string(), Instant::now()));
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ack("default")))
        }
    }

    fn ack(id: &str) -> Ack {
        Ack {
            message_ids: vec![id.to_string()],
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn outbound(text: &str) -> OutboundMessage {
        OutboundMessage {
            destination: Destination::chat("-100999"),
            text: text.to_string(),
            origin: MessageRef::new("group-A", "1"),
        }
    }

    #[test]
    fn base_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(5), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        };
        for _ in 0..100 {
            let d = policy.delay_for(2, None);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }

    #[test]
    fn retry_after_is_a_floor() {
        let policy = fast_policy(3);
        let d = policy.delay_for(1, Some(Duration::from_secs(5)));
        assert_eq!(d, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let transport = ScriptedTransport::new(vec![
            Err(SendError::transient("connection reset")),
            Err(SendError::transient("timeout")),
            Ok(ack("m1")),
        ]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(3), Shutdown::never());

        let result = dispatcher.send(&outbound("hello")).await;
        assert_eq!(result.unwrap(), ack("m1"));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn exhaustion_reports_once_after_max_attempts() {
        let transport = ScriptedTransport::new(vec![
            Err(SendError::transient("1")),
            Err(SendError::transient("2")),
            Err(SendError::transient("3")),
            Ok(ack("never")),
        ]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(3), Shutdown::never());

        match dispatcher.send(&outbound("hello")).await {
            Err(DeliveryError::Exhausted {
                attempts,
                last_error,
                ..
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error.to_string(), "Transient send failure: 3");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![Err(SendError::fatal("chat not found"))]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(5), Shutdown::never());

        let result = dispatcher.send(&outbound("hello")).await;
        assert!(matches!(result, Err(DeliveryError::Rejected { .. })));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn rate_limit_wait_is_honored() {
        let transport = ScriptedTransport::new(vec![
            Err(SendError::rate_limited("429", Duration::from_millis(80))),
            Ok(ack("m1")),
        ]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(3), Shutdown::never());

        dispatcher.send(&outbound("hello")).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        let gap = sent[1].1.duration_since(sent[0].1);
        assert!(gap >= Duration::from_millis(80), "retried after only {gap:?}");
    }

    #[tokio::test]
    async fn shutdown_cancels_backoff() {
        let transport = ScriptedTransport::new(vec![Err(SendError::rate_limited(
            "429",
            Duration::from_secs(30),
        ))]);
        let (trigger, signal) = shutdown::channel();
        let dispatcher = Arc::new(Dispatcher::new(transport.clone(), fast_policy(3), signal));

        let task = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.send(&outbound("hello")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("backoff not cancelled")
            .unwrap();
        assert!(matches!(result, Err(DeliveryError::Cancelled { attempts: 1, .. })));
    }

    #[tokio::test]
    async fn min_send_interval_spaces_sends() {
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = Dispatcher::new(transport.clone(), fast_policy(1), Shutdown::never())
            .with_min_send_interval(Duration::from_millis(50));

        dispatcher.send(&outbound("one")).await.unwrap();
        dispatcher.send(&outbound("two")).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].0, "one");
        assert_eq!(sent[1].0, "two");
        assert!(sent[1].1.duration_since(sent[0].1) >= Duration::from_millis(50));
    }
}
