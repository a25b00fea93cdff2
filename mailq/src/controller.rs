use std::{future::Future, sync::Arc, time::Duration};

use mailq_common::{internal, logging};
use mailq_delivery::{
    DryRunTransport, EventSink, MailTransport, ManagerError, QueueConfig, QueueManager,
    TracingEventSink,
};
use mailq_store::StoreConfig;
use serde::Deserialize;
use tracing::warn;

/// Top-level configuration, read from `mailq.config.ron`
///
/// ```ron
/// Mailq (
///     queue: (
///         num_workers: 8,
///         poll_interval_secs: 0.5,
///         max_retries: 10,
///     ),
///     store: (
///         type: "File",
///         path: "/var/spool/mailq",
///     ),
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Mailq {
    #[serde(default)]
    queue: QueueConfig,
    #[serde(default)]
    store: StoreConfig,
}

impl Mailq {
    /// Parse a RON configuration
    ///
    /// # Errors
    /// If `content` is not a valid configuration
    pub fn from_ron(content: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(content)?)
    }

    #[must_use]
    pub const fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    #[must_use]
    pub const fn store(&self) -> &StoreConfig {
        &self.store
    }

    /// Open the store and build a supervised queue delivering through `transport`
    ///
    /// # Errors
    /// If the store cannot be opened or the queue configuration is invalid
    pub fn build(&self, transport: Arc<dyn MailTransport>) -> anyhow::Result<Supervisor> {
        let store = self.store.build()?;
        let sink: Arc<dyn EventSink> = Arc::new(TracingEventSink);
        let manager = QueueManager::new(self.queue.clone(), store, transport, Some(sink))?;

        Ok(Supervisor::new(Arc::new(manager)))
    }

    /// Run the queue with a [`DryRunTransport`] until a shutdown signal
    ///
    /// # Errors
    /// See [`run_with`](Self::run_with)
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_with(Arc::new(DryRunTransport)).await
    }

    /// Initialise logging, then run the queue until SIGINT/SIGTERM or a
    /// fatal store error.
    ///
    /// # Errors
    /// If the queue cannot be built or started, or stops on a store failure
    pub async fn run_with(self, transport: Arc<dyn MailTransport>) -> anyhow::Result<()> {
        logging::init();
        internal!("Controller running");

        let supervisor = self.build(transport)?;
        let ret = supervisor.run(shutdown_signal()).await;

        internal!("Shutting down...");

        ret
    }
}

/// Owns a [`QueueManager`] on behalf of the process entry point.
///
/// The entry point passes in whatever future represents "time to stop"
/// (normally [`shutdown_signal`]); nothing about the queue lives in globals.
#[derive(Debug, Clone)]
pub struct Supervisor {
    manager: Arc<QueueManager>,
    shutdown_timeout: Duration,
}

impl Supervisor {
    pub fn new(manager: Arc<QueueManager>) -> Self {
        let shutdown_timeout = manager.config().shutdown_timeout();

        Self {
            manager,
            shutdown_timeout,
        }
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    /// Start the queue and keep it running until `shutdown` completes, then
    /// drain for up to the configured `shutdown_timeout`.
    ///
    /// # Errors
    /// If the queue fails to start, stops on a store failure, or `shutdown`
    /// itself fails
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        self.manager.start().await?;

        tokio::select! {
            stopped = self.manager.wait() => {
                stopped?;
                Ok(())
            }
            signalled = shutdown => {
                self.stop().await?;
                signalled
            }
        }
    }

    async fn stop(&self) -> anyhow::Result<()> {
        match self.manager.stop(self.shutdown_timeout).await {
            Ok(report) => {
                if report.abandoned > 0 {
                    warn!(
                        abandoned = report.abandoned,
                        "Stopped with deliveries in flight; they will be retried once their lease expires"
                    );
                }
                internal!(
                    level = INFO,
                    "Queue drained: {} completed, {} abandoned",
                    report.completed,
                    report.abandoned
                );
                Ok(())
            }
            // Already stopping on its own; let that finish.
            Err(ManagerError::InvalidState { .. }) => Ok(self.manager.wait().await?),
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolves on the first SIGINT (Ctrl+C) or SIGTERM.
///
/// # Errors
/// If the signal handlers cannot be installed
pub async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            internal!("CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    Ok(())
}
