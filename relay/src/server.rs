//! Relay server wiring: public listener, upgrade endpoint, agent pool.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use burrow_protocol::auth;

use crate::config::RelayConfig;
use crate::handler::forward_handler;
use crate::pool::Pool;
use crate::tunnel::Tunnel;

/// State shared across handlers.
pub struct AppState {
    pub pool: Arc<Pool>,
    pub config: RelayConfig,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(config: RelayConfig) -> SharedState {
        Arc::new(Self {
            pool: Pool::new(),
            config,
        })
    }
}

/// The tunnel path goes to the upgrade handler; everything else is
/// forwarded through the pool.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route(&state.config.tunnel.path, get(tunnel_handler))
        .fallback(forward_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// WebSocket upgrade requests from agents. The token comes from the `token`
/// query parameter, or the `X-Auth-Token` header as a fallback; any
/// validation failure is a bare 401 with no upgrade.
async fn tunnel_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<SharedState>,
) -> Response {
    let token = params
        .get("token")
        .cloned()
        .or_else(|| {
            headers
                .get("x-auth-token")
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .unwrap_or_default();

    if let Err(err) = auth::validate_token(&state.config.auth.shared_secret, &token) {
        warn!(%err, %remote, "agent auth failed");
        return (StatusCode::UNAUTHORIZED, "unauthorised").into_response();
    }

    ws.on_upgrade(move |socket| register_agent(socket, remote, state))
}

async fn register_agent(socket: WebSocket, remote: SocketAddr, state: SharedState) {
    let id = format!("agent-{remote}");
    info!(%id, %remote, "agent connected");
    let tunnel = Tunnel::spawn(id, socket, state.config.tunnel.ping_interval());
    state.pool.add(tunnel).await;
}

/// Serve on an already-bound listener. Exposed separately so tests can bind
/// to a random port first.
pub async fn serve(listener: TcpListener, state: SharedState) -> Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("relay server exited")
}

/// Start the relay server and block until it exits.
pub async fn run(config: RelayConfig) -> Result<()> {
    info!(addr = %config.listen.addr, tls = config.tls.enabled, "relay server starting");
    let state = AppState::new(config.clone());

    if config.tls.enabled {
        let (cert, key) = config.tls.cert_paths()?;
        let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key)
            .await
            .context("loading tls certificate")?;
        let addr: SocketAddr = config
            .listen
            .addr
            .parse()
            .context("parsing listen address")?;
        return axum_server::bind_rustls(addr, rustls)
            .serve(router(state).into_make_service_with_connect_info::<SocketAddr>())
            .await
            .context("relay server exited");
    }

    let listener = TcpListener::bind(&config.listen.addr)
        .await
        .with_context(|| format!("binding {}", config.listen.addr))?;
    serve(listener, state).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
