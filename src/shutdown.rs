//! Cooperative shutdown flag shared by the reader task and the sample loop.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Cloneable shutdown handle.
///
/// Loops poll [`is_triggered`](Shutdown::is_triggered) at each iteration
/// boundary, or race [`wait`](Shutdown::wait) against their sleeps.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Request shutdown of every loop holding a clone of this handle
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Wait for SIGINT or SIGTERM, then trigger `shutdown`.
pub async fn trigger_on_signal(shutdown: Shutdown) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT, shutting down...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    shutdown.trigger();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[test]
    fn test_starts_untriggered() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
    }

    #[test]
    fn test_trigger_visible_to_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        shutdown.trigger();
        assert!(clone.is_triggered());
    }

    #[tokio::test]
    async fn test_wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let mut waiter = shutdown.clone();

        let handle = tokio::spawn(async move { waiter.wait().await });
        shutdown.trigger();

        assert!(timeout(Duration::from_secs(1), handle).await.is_ok());
    }

    #[test]
    fn test_wait_pending_until_triggered() {
        let shutdown = Shutdown::new();
        let mut waiter = shutdown.clone();
        let mut wait = tokio_test::task::spawn(async move { waiter.wait().await });

        tokio_test::assert_pending!(wait.poll());
        shutdown.trigger();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_triggered() {
        let mut shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(timeout(Duration::from_millis(10), shutdown.wait()).await.is_ok());
    }
}
