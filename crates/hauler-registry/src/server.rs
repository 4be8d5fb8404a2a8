//! Serving a store over the distribution v2 API.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::header::{HeaderName, HeaderValue};
use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use hauler::Store;

use crate::handlers::{oci_dispatch, v2_base, AppState};

/// Header every response carries.
pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";

/// Value of [`API_VERSION_HEADER`].
pub const API_VERSION: &str = "registry/2.0";

/// Options for [`serve`].
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Listen address.
    pub addr: SocketAddr,
    /// Reject every mutating request with 405.
    pub read_only: bool,
    /// Upload sessions older than this are deleted at startup.
    pub upload_ttl: Duration,
    /// How long in-flight requests may run after a shutdown signal.
    pub shutdown_timeout: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            read_only: false,
            upload_ttl: Duration::from_secs(24 * 60 * 60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// The `/v2/` router for `store`.
pub fn router(store: Arc<Store>, read_only: bool) -> Router {
    let state = AppState { store, read_only };
    Router::new()
        .route("/v2", get(v2_base))
        .route("/v2/", get(v2_base))
        .route("/v2/{*path}", any(oci_dispatch))
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static(API_VERSION_HEADER),
            HeaderValue::from_static(API_VERSION),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Bind `config.addr` and serve until SIGINT, SIGTERM or `shutdown`.
pub async fn serve(store: Arc<Store>, config: &ServeConfig, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    serve_on(store, listener, config, shutdown).await
}

/// Serve on an already bound listener.
///
/// Abandoned upload sessions are reaped first. After a shutdown signal new
/// connections are refused and in-flight requests get
/// `config.shutdown_timeout` to finish.
pub async fn serve_on(
    store: Arc<Store>,
    listener: TcpListener,
    config: &ServeConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let reaped = store
        .uploads()
        .reap(config.upload_ttl)
        .await
        .context("reaping upload sessions")?;
    if reaped > 0 {
        tracing::info!("reaped {reaped} abandoned upload sessions");
    }

    let addr = listener.local_addr()?;
    tracing::info!(
        read_only = config.read_only,
        "serving {} on {addr}",
        store.root().display()
    );

    let draining = CancellationToken::new();
    let app = router(store, config.read_only);
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let draining = draining.clone();
        async move {
            shutdown_signal(shutdown).await;
            tracing::info!("shutting down");
            draining.cancel();
        }
    });
    let server = server.into_future();
    tokio::pin!(server);

    let timeout = config.shutdown_timeout;
    tokio::select! {
        res = &mut server => res.context("serving registry")?,
        _ = async {
            draining.cancelled().await;
            tokio::time::sleep(timeout).await;
        } => {
            tracing::warn!("shutdown window of {timeout:?} elapsed, dropping in-flight requests");
        }
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
        _ = shutdown.cancelled() => {}
    }
}
