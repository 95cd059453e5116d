//! Connection boundary for the relay server.
//!
//! Authorizes upgrade requests, upgrades them to WebSockets and hands each
//! socket to a [`Client`] bound to the shared hub.

use crate::auth::{Authorizer, TokenAuthorizer};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use relay_core::{Client, ClientError, Hub, HubHandle, Identity};
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Handle to the hub routing loop.
    pub hub: HubHandle,
    /// Server configuration.
    pub config: Config,
    /// Decides who may connect.
    pub authorizer: Arc<dyn Authorizer>,
}

impl AppState {
    /// Create state with the token authorizer described by `config`.
    #[must_use]
    pub fn new(config: Config, hub: HubHandle) -> Self {
        let authorizer = TokenAuthorizer::from_config(&config.auth);
        if authorizer.is_empty() && !config.auth.allow_anonymous {
            warn!("No tokens configured and anonymous access disabled; every upgrade will be refused");
        }
        Self::with_authorizer(config, hub, Arc::new(authorizer))
    }

    /// Create state with a custom authorizer.
    #[must_use]
    pub fn with_authorizer(config: Config, hub: HubHandle, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            hub,
            config,
            authorizer,
        }
    }
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Credential handed to the authorizer.
    pub token: Option<String>,
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until ctrl-c.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn run_server(config: Config) -> Result<()> {
    config.validate()?;
    let (hub, _hub_task) = Hub::spawn(config.hub_config());

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(metrics::observe_hub(hub.subscribe_stats()));
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone(), hub));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Relay server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": state.hub.stats().clients,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let identity = match state.authorizer.authorize(params.token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "Upgrade refused");
            metrics::record_rejected("unauthorized");
            return (StatusCode::FORBIDDEN, e.to_string()).into_response();
        }
    };

    let clients = state.hub.stats().clients;
    if clients >= state.config.limits.max_connections {
        warn!(clients, "Connection limit reached");
        metrics::record_rejected("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    ws.max_message_size(state.config.limits.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, identity, state))
}

/// Drive one upgraded connection to completion.
async fn handle_websocket(socket: WebSocket, identity: Identity, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let client = Client::new(identity, state.hub.clone(), state.config.client_config());
    let key = client.key();
    debug!(client = %key, uid = %client.identity().id, "WebSocket connected");

    if let Err(e) = client.run(socket).await {
        metrics::record_error(error_kind(&e));
        debug!(client = %key, error = %e, "Connection ended with error");
    }
}

fn error_kind(error: &ClientError) -> &'static str {
    match error {
        ClientError::Transport(_) => "transport",
        ClientError::Protocol(_) => "protocol",
        ClientError::Hub(_) => "hub",
    }
}
