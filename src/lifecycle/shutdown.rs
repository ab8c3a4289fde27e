//! Shutdown coordination for the proxy.

use tokio::sync::watch;

/// Coordinator for graceful shutdown.
///
/// Accept loops subscribe and stop taking connections once triggered.
/// Subscribers created after the trigger observe it immediately.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Number of listeners still alive (accept loops still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half handed to long-running tasks.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once shutdown has been triggered or the coordinator dropped.
    pub async fn wait(&mut self) {
        // An Err means the sender is gone, which is as final as a trigger.
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn early_and_late_subscribers_both_see_trigger() {
        let shutdown = Shutdown::new();
        let mut early = shutdown.subscribe();
        assert!(!shutdown.is_triggered());

        let waiter = tokio::spawn(async move { early.wait().await });
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        let mut late = shutdown.subscribe();
        tokio::time::timeout(Duration::from_millis(100), late.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_coordinator_releases_listeners() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.subscribe();
        drop(shutdown);
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .unwrap();
    }
}
