//! A data-locality-aware secondary scheduler for Kubernetes.

mod app;
mod backend;
mod config;
mod error;
#[cfg(test)]
mod fixtures;
mod k8s;
mod scheduler;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use crate::app::App;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    tracing::info!(
        backend = ?cfg.backend,
        quobyte_api_url = %cfg.quobyte_api_url,
        quobyte_mountpoint = %cfg.quobyte_mountpoint,
        quobyte_namespace = %cfg.quobyte_namespace,
        in_cluster = %cfg.in_cluster,
        sweep_interval_seconds = %cfg.sweep_interval_seconds,
        "starting data-locality scheduler",
    );
    if let Err(err) = App::new(cfg).await?.spawn().await {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    Ok(())
}
