use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::get,
};
use flagforge_storage::DynStorage;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::cache::{
    EvictLocalSnapshots, InvalidationPublisher, InvalidationSubscriber, SnapshotCache,
    spawn_supervised, wait_for_shutdown,
};
use crate::service::{FlagService, InvalidationMode};
use crate::{CacheLayer, config::AppConfig, create_cache_backend, create_storage, handlers};

/// Handles shared by every request.
#[derive(Clone)]
pub struct AppState {
    pub snapshots: Arc<SnapshotCache>,
    pub flags: FlagService,
}

impl AppState {
    /// Wires the read and write paths over a store and a cache layer.
    pub fn new(store: DynStorage, layer: &CacheLayer, cfg: &AppConfig) -> Self {
        let operation_timeout = cfg.cache.operation_timeout();
        let publisher = Arc::new(InvalidationPublisher::new(
            layer.cache.clone(),
            layer.bus.clone(),
            operation_timeout,
        ));
        let flags = FlagService::new(
            store.clone(),
            publisher,
            InvalidationMode::from_await_flag(cfg.invalidation.await_before_response),
            operation_timeout,
        );
        let snapshots = Arc::new(SnapshotCache::new(
            store,
            layer.cache.clone(),
            cfg.cache.snapshot_settings(),
        ));
        Self { snapshots, flags }
    }
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;
    Router::new()
        // Health and info endpoints
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        // Flag API
        .route(
            "/v1/flags",
            get(handlers::list_flags).post(handlers::create_flag),
        )
        .route("/v1/flags/{id}/audit", get(handlers::flag_audit))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(|req: &axum::http::Request<_>| {
                            use tracing::field::Empty;
                            tracing::info_span!(
                                "http.request",
                                http.method = %req.method(),
                                http.target = %req.uri(),
                                http.status_code = Empty,
                            )
                        })
                        .on_response(
                            |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                                span.record(
                                    "http.status_code",
                                    tracing::field::display(res.status().as_u16()),
                                );
                                tracing::info!(
                                    http.status = %res.status().as_u16(),
                                    elapsed_ms = %latency.as_millis(),
                                    "request handled"
                                );
                            },
                        ),
                )
                .layer(CompressionLayer::new())
                .layer(CorsLayer::permissive()),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// The API process: router plus the invalidation subscriber evicting its L1 tier.
pub struct FlagforgeServer {
    addr: SocketAddr,
    app: Router,
    shutdown_timeout: Duration,
    shutdown: watch::Sender<bool>,
    subscriber: JoinHandle<()>,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    storage: Option<DynStorage>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            storage: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Uses an existing store instead of building one from configuration.
    pub fn with_storage(mut self, storage: DynStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub async fn build(self) -> anyhow::Result<FlagforgeServer> {
        let store = match self.storage {
            Some(store) => store,
            None => create_storage(&self.config.storage).await?,
        };
        let layer = create_cache_backend(
            &self.config.redis,
            &self.config.cache,
            &self.config.invalidation.channel,
        )
        .await;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let subscriber = Arc::new(InvalidationSubscriber::new(
            layer.bus.clone(),
            Arc::new(EvictLocalSnapshots::new(layer.local.clone())),
        ));
        let subscriber = spawn_supervised(subscriber, shutdown_rx);

        let state = AppState::new(store, &layer, &self.config);
        let app = build_app(state, &self.config);

        tracing::info!(
            storage = %self.config.storage.backend,
            cache = layer.mode(),
            channel = %self.config.invalidation.channel,
            "server initialized"
        );

        Ok(FlagforgeServer {
            addr: self.addr,
            app,
            shutdown_timeout: self.config.shutdown_timeout(),
            shutdown,
            subscriber,
        })
    }
}

impl FlagforgeServer {
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        serve_until_shutdown(listener, self.app, self.shutdown.clone(), self.shutdown_timeout)
            .await?;

        let _ = self.shutdown.send(true);
        if tokio::time::timeout(self.shutdown_timeout, self.subscriber)
            .await
            .is_err()
        {
            tracing::warn!("invalidation subscriber did not stop in time");
        }
        Ok(())
    }
}

/// Serves `app` until SIGINT/SIGTERM, then gives in-flight requests `drain`
/// to finish. The signal is forwarded on `shutdown`.
pub async fn serve_until_shutdown(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: watch::Sender<bool>,
    drain: Duration,
) -> anyhow::Result<()> {
    let mut shutdown_rx = shutdown.subscribe();
    let signal_tx = shutdown.clone();
    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });
    let mut server = tokio::spawn(async move { serve.await });

    tokio::select! {
        joined = &mut server => joined??,
        _ = wait_for_shutdown(&mut shutdown_rx) => {
            match tokio::time::timeout(drain, &mut server).await {
                Ok(joined) => joined??,
                Err(_) => {
                    tracing::warn!(drain_ms = drain.as_millis() as u64, "shutdown drain timed out");
                    server.abort();
                }
            }
        }
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
