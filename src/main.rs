// =============================================================================
// coinscope: Main Entry Point
// =============================================================================
//
// Boots the ingestion pipeline behind a read-only HTTP API. Nothing runs in
// the background: every fetch is driven by a request and shared through the
// result cache.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod analysis;
mod api;
mod app_state;
mod cache;
mod error;
mod indicators;
mod market_data;
mod pipeline;
mod runtime_config;
mod source;
mod types;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::pipeline::Pipeline;
use crate::runtime_config::{RuntimeConfig, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("coinscope starting up");

    let config_path =
        std::env::var("COINSCOPE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config_exists = std::path::Path::new(&config_path).exists();

    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Leave a template behind on first run so operators have something to edit.
    if !config_exists {
        if let Err(e) = config.save(&config_path) {
            warn!(path = %config_path, error = %e, "could not write default config");
        }
    }

    config.apply_env_overrides();

    info!(
        provider = %config.provider,
        base_url = %config.base_url_or_default(),
        lookback_bars = config.lookback_bars,
        cache_capacity = config.cache_capacity,
        cache_dir = ?config.cache_dir,
        "Configuration resolved"
    );

    // ── 2. Source client & pipeline ──────────────────────────────────────
    let source = Arc::from(source::from_config(&config)?);
    let pipeline = Pipeline::new(source, &config);
    info!(
        source = pipeline.source_name(),
        indicators = ?indicators::available().collect::<Vec<_>>(),
        "Pipeline ready"
    );

    // ── 3. Shared state ──────────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::new(pipeline, config));

    // ── 4. API server ────────────────────────────────────────────────────
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for shutdown signal");
            }
            warn!("Shutdown signal received, stopping gracefully");
        })
        .await
        .context("API server failed")?;

    info!("coinscope shut down complete.");
    Ok(())
}
