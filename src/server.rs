//! HTTP surface: WebSocket upgrade, NIP-11 document, stats, and health.

use std::{future::Future, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use crate::config::Settings;
use crate::event;
use crate::hub::Hub;
use crate::ingest::Ingest;
use crate::store::Store;
use crate::ws;

/// NIPs implemented by this relay, sorted.
pub const SUPPORTED_NIPS: &[u32] = &[1, 2, 9, 11, 12, 13, 15, 16, 20, 22, 26, 33, 40, 42, 45, 50];

/// Shared handles threaded through every handler and session.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub hub: Arc<Hub>,
    pub ingest: Arc<Ingest>,
    pub settings: Arc<Settings>,
}

/// Wire the store, hub, and ingest pipeline together.
pub fn build_state(settings: Settings, store: Store) -> AppState {
    let hub = Arc::new(Hub::new());
    let settings = Arc::new(settings);
    let ingest = Arc::new(Ingest::new(store.clone(), hub.clone(), settings.clone()));
    AppState {
        store,
        hub,
        ingest,
        settings,
    }
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(root))
        .route("/relay/info", get(relay_info))
        .route("/relay/stats", get(relay_stats))
        .route("/health", get(health))
        .with_state(state)
}

/// The WebSocket endpoint doubles as the NIP-11 document when asked for
/// `application/nostr+json`, and a plain banner otherwise.
async fn root(
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if let Some(upgrade) = ws {
        return upgrade.on_upgrade(move |socket| ws::handle_socket(socket, state));
    }
    let wants_nip11 = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/nostr+json"));
    if wants_nip11 {
        return nip11_response(&state);
    }
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        format!(
            "{} - a Nostr relay. Connect with a WebSocket client.\n",
            state.settings.name
        ),
    )
        .into_response()
}

async fn relay_info(State(state): State<AppState>) -> Response {
    nip11_response(&state)
}

fn nip11_response(state: &AppState) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/nostr+json"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
        ],
        nip11_doc(&state.settings).to_string(),
    )
        .into_response()
}

/// Build the NIP-11 relay information document.
fn nip11_doc(settings: &Settings) -> serde_json::Value {
    let now = event::unix_now();
    let mut posting_policy =
        String::from("Replaceable events older than the stored version are rejected.");
    if settings.owner_only {
        posting_policy =
            format!("Owner-only relay; only the configured owner key may publish. {posting_policy}");
    }
    json!({
        "name": settings.name,
        "description": settings.description,
        "pubkey": settings.owner_pubkey.clone().unwrap_or_default(),
        "contact": settings.contact,
        "supported_nips": SUPPORTED_NIPS,
        "software": "homestr",
        "version": env!("CARGO_PKG_VERSION"),
        "limitation": {
            "max_message_length": ws::MAX_FRAME_LEN,
            "max_subscriptions": ws::MAX_SUBSCRIPTIONS,
            "max_filters": ws::MAX_FILTERS,
            "max_limit": ws::MAX_LIMIT,
            "max_subid_length": ws::MAX_SUBID_LEN,
            "max_event_tags": event::MAX_EVENT_TAGS,
            "max_content_length": event::MAX_CONTENT_LEN,
            "min_pow_difficulty": settings.min_pow,
            "auth_required": false,
            "payment_required": false,
            "restricted_writes": settings.owner_only,
            "created_at_lower_limit": now - settings.created_at_past_limit,
            "created_at_upper_limit": now + settings.created_at_future_limit,
        },
        "posting_policy": posting_policy,
    })
}

async fn relay_stats(State(state): State<AppState>) -> Response {
    let total = state.store.total_events().unwrap_or(0);
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(json!({
            "connected_clients": state.hub.session_count().await,
            "total_events": total,
            "supported_nips": SUPPORTED_NIPS,
            "owner_only": state.settings.owner_only,
            "relay_name": state.settings.name,
        })),
    )
        .into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    (
        [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
        Json(json!({
            "status": "ok",
            "clients": state.hub.session_count().await,
        })),
    )
        .into_response()
}
