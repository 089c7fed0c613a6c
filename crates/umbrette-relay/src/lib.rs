use anyhow::Result;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use umbrette_core::nostr::RawEvent;
use umbrette_core::{logging, server};

pub mod codec;
pub mod config;
pub mod filters;
pub mod info;
pub mod registry;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use crate::config::RelayConfig;
use crate::store::sqlite::StoreLimits;
use crate::store::{EventStore, SqliteStore};

const SERVICE_NAME: &str = "umbrette-relay";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    /// Accepted events, fanned out to every connection's live subscriptions.
    pub realtime_tx: broadcast::Sender<RawEvent>,
    pub config: Arc<RelayConfig>,
}

#[derive(Serialize)]
struct HealthStatus {
    status: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run(config: RelayConfig) -> Result<()> {
    logging::init(SERVICE_NAME);
    let pool = store::sqlite::connect(&config.database_url).await?;
    let store = SqliteStore::new(
        pool,
        StoreLimits {
            max_event_bytes: config.max_event_bytes,
            max_tags: config.max_tags,
        },
    );
    store.init().await?;

    let (realtime_tx, _) = broadcast::channel(256);
    let addr = config.addr;
    tracing::info!(url = %config.relay_url(), "relay ready");

    let state = AppState {
        store: Arc::new(store),
        realtime_tx,
        config: Arc::new(config),
    };
    server::serve(addr, router(state)).await
}

/// NIP-11 on `Accept: application/nostr+json`, the relay session on a
/// WebSocket upgrade, and a hint for everyone else.
async fn root(
    State(state): State<AppState>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        == Some("application/nostr+json")
    {
        return Json(info::relay_information(&state.config)).into_response();
    }

    match ws {
        Some(ws) => {
            let remote = addr.map(|ConnectInfo(addr)| addr);
            ws.on_upgrade(move |socket| session::handle_socket(state, remote, socket))
        }
        None => (
            StatusCode::BAD_REQUEST,
            "Please use a Nostr client to connect to this relay.",
        )
            .into_response(),
    }
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ready().await {
        Ok(()) => (StatusCode::OK, Json(HealthStatus { status: "ok".into() })),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "unavailable".into(),
            }),
        ),
    }
}
