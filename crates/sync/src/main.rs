//! `mercato-syncd`: runs the sync engine headless until Ctrl-C.

use anyhow::Context;
use mercato_sync::{EngineConfig, MercatoEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mercato_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    if config.auth_token.is_none() {
        tracing::warn!("MERCATO_AUTH_TOKEN not set, remote requests are unauthenticated");
    }

    let engine = MercatoEngine::open(config).await?;
    let pending = engine.pending_count().await?;
    tracing::info!(pending, "sync daemon running");

    let _listener = engine.on_connectivity_changed(|state| tracing::info!(?state, "connectivity"));

    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    engine.shutdown().await;
    Ok(())
}
