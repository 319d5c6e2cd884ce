//! Process-wide shutdown signal.
//!
//! A `tokio::sync::watch` channel flipped once from `false` to `true`. Every
//! cancellable wait in the relay selects on [`Shutdown::wait`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Sending half, held by whoever decides when to stop.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

/// Receiving half, cloned into every task.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    /// Sender owned by a [`Shutdown::never`] signal.
    _sender: Option<Arc<watch::Sender<bool>>>,
}

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx, _sender: None })
}

impl ShutdownTrigger {
    /// Signal shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn subscribe(&self) -> Shutdown {
        Shutdown {
            rx: self.tx.subscribe(),
            _sender: None,
        }
    }
}

impl Shutdown {
    /// A signal that never fires (for tests and one-off use).
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            rx,
            _sender: Some(Arc::new(tx)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been signalled.
    ///
    /// If the trigger is dropped without firing, this pends forever.
    pub async fn wait(&mut self) {
        if self.rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration` unless shutdown fires first.
    ///
    /// Returns `true` if the full duration elapsed.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.wait() => false,
        }
    }
}

/// Listen for Ctrl+C and, on unix, SIGTERM.
///
/// Handlers are installed before this returns. The future resolves with the
/// name of the first signal received.
pub fn os_signals() -> std::io::Result<impl Future<Output = &'static str>> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        #[cfg(unix)]
        let terminated = async move {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let terminated = std::future::pending::<()>();

        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => "SIGINT",
            _ = terminated => "SIGTERM",
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_without_trigger() {
        let (_trigger, mut shutdown) = channel();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test]
    async fn trigger_cancels_sleep() {
        let (trigger, mut shutdown) = channel();
        let handle = tokio::spawn(async move { shutdown.sleep(Duration::from_secs(30)).await });
        trigger.trigger();
        let slept = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sleep was not cancelled")
            .unwrap();
        assert!(!slept);
    }

    #[tokio::test]
    async fn subscribers_see_trigger() {
        let (trigger, _shutdown) = channel();
        let mut late = trigger.subscribe();
        trigger.trigger();
        late.wait().await;
        assert!(late.is_triggered());
    }

    #[tokio::test]
    async fn never_does_not_fire() {
        let mut shutdown = Shutdown::never();
        assert!(shutdown.sleep(Duration::from_millis(5)).await);
    }

    #[test]
    fn never_owns_its_sender() {
        let shutdown = Shutdown::never();
        let clone = shutdown.clone();
        assert!(!shutdown.rx.has_changed().unwrap());
        drop(shutdown);
        // The sender lives as long as any clone does, and is freed with the last.
        assert!(clone.rx.has_changed().is_ok());
        let sender = clone._sender.clone().unwrap();
        drop(clone);
        assert_eq!(Arc::strong_count(&sender), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sigterm_is_reported() {
        let signals = os_signals().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let name = tokio::time::timeout(Duration::from_secs(5), signals)
            .await
            .expect("SIGTERM not observed");
        assert_eq!(name, "SIGTERM");
    }
}
