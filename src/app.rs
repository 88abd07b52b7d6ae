use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::backend::quobyte::QuobyteBackend;
use crate::config::Config;
use crate::scheduler::Scheduler;

/// The application object for when the scheduler is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the scheduling loop.
    scheduler: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, shutdown_rx) = broadcast::channel(10);

        // Initialize K8s client.
        let client = kube::Client::try_default().await.context("error initializing K8s client")?;

        // Spawn the scheduling loop with its storage backend.
        let backend = Arc::new(QuobyteBackend::new(&config, client.clone()).context("error building storage backend")?);
        let scheduler = Scheduler::new(client, config.clone(), backend, shutdown_tx.subscribe()).spawn();

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_rx),
            shutdown_tx,
            scheduler,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("scheduler is shutting down");
        if let Err(err) = self.scheduler.await.context("error joining scheduling loop handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down scheduling loop");
        }

        tracing::debug!("scheduler shutdown complete");
        Ok(())
    }
}
