//! Router assembly and the serve loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use nanobot_session::Session;
use nanobot_types::Message;
use serde_json::json;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

use crate::callback::oauth_callback;
use crate::endpoint::{atp_delete, atp_get, atp_post};
use crate::state::GatewayState;

const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub listen: SocketAddr,
    pub endpoint_path: String,
    pub health_path: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 8080).into(),
            endpoint_path: "/mcp".to_string(),
            health_path: "/healthz".to_string(),
        }
    }
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    state.health.status()
}

/// Build the full router: ATP endpoint, OAuth callback, liveness.
pub fn router(config: &GatewayConfig, state: GatewayState) -> Router {
    Router::new()
        .route(
            &config.endpoint_path,
            axum::routing::post(atp_post).get(atp_get).delete(atp_delete),
        )
        .route("/oauth/callback", get(oauth_callback))
        .route(&config.health_path, get(health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Probe used by the health ticker: a throwaway internal session lists the
/// published tools and demands at least one.
async fn health_probe(state: GatewayState) -> Result<(), String> {
    let session = Arc::new(Session::new(
        format!("health-{}", uuid::Uuid::new_v4()),
        state.store.progress_floor(),
    ));
    state.wire_session(&session);
    Session::dispatch(
        &session,
        Message::request(
            1,
            "initialize",
            json!({
                "protocolVersion": "2025-06-18",
                "clientInfo": {"name": "nanobot-health", "version": env!("CARGO_PKG_VERSION")}
            }),
        ),
    )
    .await
    .map_err(|e| e.to_string())?;
    let response = Session::dispatch(&session, Message::request(2, "tools/list", json!({})))
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "tools/list yielded no response".to_string())?;
    if let Some(error) = response.error {
        return Err(error.to_string());
    }
    let count = response
        .result
        .as_ref()
        .and_then(|r| r.get("tools"))
        .and_then(|t| t.as_array())
        .map(|t| t.len())
        .unwrap_or(0);
    if count == 0 {
        return Err("no tools published".to_string());
    }
    Ok(())
}

/// Serve until SIGINT/SIGTERM, then drain in-flight requests with a bounded
/// deadline.
pub async fn run(config: GatewayConfig, state: GatewayState) -> std::io::Result<()> {
    let probe_state = state.clone();
    crate::health::HealthState::spawn_ticker(&state.health, move || {
        health_probe(probe_state.clone())
    });

    let app = router(&config, state);
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(listen = %config.listen, endpoint = %config.endpoint_path, "atp endpoint up");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install SIGINT handler");
    };
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(deadline = ?DRAIN_DEADLINE, "shutdown signal received, draining");
    // Bound the drain: if a request is stuck past the deadline, go down
    // anyway.
    tokio::spawn(async {
        tokio::time::sleep(DRAIN_DEADLINE).await;
        warn!("drain deadline reached, exiting");
        std::process::exit(0);
    });
}
