use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

use crate::{
    cache::{CacheInvalidator, CacheStore},
    config::AppConfig,
    handlers, middleware as app_middleware,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: CacheStore,
    pub invalidator: CacheInvalidator,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, store: CacheStore) -> Self {
        Self {
            invalidator: CacheInvalidator::new(store.clone()),
            store,
            config: Arc::new(config),
        }
    }
}

pub struct GigcacheServer {
    addr: SocketAddr,
    app: Router,
    store: CacheStore,
}

pub fn build_app(cfg: &AppConfig, store: CacheStore) -> Router {
    let state = AppState::new(cfg.clone(), store);
    let body_limit = cfg.server.body_limit_bytes;

    let mut router = Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics));

    if cfg.cache.admin_routes {
        tracing::info!("Cache admin routes enabled");
        router = router
            .route("/cache/{prefix}", delete(handlers::invalidate_prefix))
            .route(
                "/cache/{prefix}/users/{user_id}",
                delete(handlers::invalidate_user),
            )
            .route("/cache/{prefix}/invalidate", post(handlers::invalidate_users));
    }

    router
        .with_state(state)
        // Outermost is added last: body limit -> request id -> trace.
        // request_id has to run before the trace span is created.
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    store: Option<CacheStore>,
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
            store: None,
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

    /// Use an already connected store instead of connecting from config.
    pub fn with_store(mut self, store: CacheStore) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn build(self) -> GigcacheServer {
        let store = match self.store {
            Some(store) => {
                crate::metrics::set_store_available(store.is_available());
                store
            }
            None => CacheStore::connect(&self.config.redis).await,
        };

        let app = build_app(&self.config, store.clone());

        GigcacheServer {
            addr: self.addr,
            app,
            store,
        }
    }
}

impl GigcacheServer {
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        let served = axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        // Close the store even when serving failed.
        self.store.disconnect().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
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
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
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
