//! bsmld — BioSignalML signal streaming daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use bsml_api::ApiState;
use bsml_core::config::BsmlConfig;
use bsml_services::{
    serve_connections, FormatRegistry, MemoryRepository, RecordingStore, StreamContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = BsmlConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = BsmlConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BsmlConfig::default()
    });
    tracing::info!(
        max_points = config.streaming.max_points,
        response_checksum = ?config.streaming.response_checksum,
        "bsmld starting"
    );

    let recordings = config.storage.recordings_path.clone();
    std::fs::create_dir_all(&recordings)
        .with_context(|| format!("failed to create {}", recordings.display()))?;

    let ctx = Arc::new(StreamContext {
        repository: Arc::new(MemoryRepository::new()),
        formats: Arc::new(FormatRegistry::with_builtin()),
        streaming: config.streaming.clone(),
    });

    // ── Shutdown ─────────────────────────────────────────────────────────────

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Block-protocol socket ────────────────────────────────────────────────

    let socket_addr: SocketAddr = format!("{}:{}", config.network.bind, config.network.socket_port)
        .parse()
        .context("invalid socket listen address")?;
    let listener = TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("failed to bind {socket_addr}"))?;
    let socket_task = tokio::spawn(serve_connections(listener, ctx.clone(), shutdown_tx.subscribe()));

    // ── HTTP API ─────────────────────────────────────────────────────────────

    let http_addr: SocketAddr = format!("{}:{}", config.network.bind, config.network.http_port)
        .parse()
        .context("invalid HTTP listen address")?;
    let api_state = ApiState {
        ctx,
        store: Arc::new(RecordingStore::new(recordings)),
        base_uri: config.storage.base_uri.clone(),
    };
    let api_task = tokio::spawn(bsml_api::serve(api_state, http_addr, shutdown_tx.subscribe()));

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv() => tracing::info!("shutting down"),
        r = socket_task        => tracing::error!("socket listener exited: {:?}", r),
        r = api_task           => tracing::error!("HTTP API exited: {:?}", r),
    }

    Ok(())
}
