//! Standalone invalidation worker.
//!
//! Subscribes to the invalidation channel and records every project id it
//! receives. Exposes `/healthz` on `worker.port`.

use std::sync::Arc;

use axum::{Router, routing::get};
use flagforge_server::cache::{InvalidationSubscriber, RecordInvalidation, spawn_supervised};
use flagforge_server::config::loader::{load_config, resolve_config_path};
use flagforge_server::server::serve_until_shutdown;
use flagforge_server::{create_cache_backend, handlers};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    flagforge_server::observability::init_tracing();

    let (config_path, source) = resolve_config_path();
    let cfg = match load_config(Some(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(path = %config_path, source = %source, "Configuration loaded");

    flagforge_server::observability::apply_logging_level(&cfg.logging.level);
    flagforge_server::metrics::init_metrics();

    if let Err(err) = run(cfg).await {
        eprintln!("Worker error: {err}");
        std::process::exit(1);
    }
}

async fn run(cfg: flagforge_server::AppConfig) -> anyhow::Result<()> {
    let layer = create_cache_backend(&cfg.redis, &cfg.cache, &cfg.invalidation.channel).await;
    if layer.mode() == "local" {
        tracing::warn!("worker running without Redis; only in-process invalidations are visible");
    }

    let recorder = Arc::new(RecordInvalidation::new());
    let subscriber = Arc::new(InvalidationSubscriber::new(layer.bus.clone(), recorder.clone()));

    let (shutdown, shutdown_rx) = watch::channel(false);
    let subscriber = spawn_supervised(subscriber, shutdown_rx);

    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics));

    let addr = cfg.worker_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, channel = %cfg.invalidation.channel, "worker listening");

    serve_until_shutdown(listener, app, shutdown.clone(), cfg.shutdown_timeout()).await?;

    let _ = shutdown.send(true);
    if tokio::time::timeout(cfg.shutdown_timeout(), subscriber)
        .await
        .is_err()
    {
        tracing::warn!("invalidation subscriber did not stop in time");
    }
    tracing::info!(received = recorder.received(), "worker stopped");
    Ok(())
}
