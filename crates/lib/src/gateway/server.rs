//! Gateway HTTP server: status, QR, filters and bridge intake on a single port.

use crate::channels::{BridgeEvent, TransportEvent, BRIDGE_SECRET_HEADER};
use crate::filter::MessageFilter;
use crate::gateway::pairing;
use crate::session::SessionTracker;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Where bridge events go once accepted.
#[derive(Clone)]
pub struct BridgeIntake {
    pub events_tx: mpsc::Sender<TransportEvent>,
    /// When Some, event POSTs must carry this value in `X-Parley-Bridge-Secret`.
    pub secret: Option<String>,
}

/// Shared state for the gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub port: u16,
    pub session: Arc<SessionTracker>,
    pub filter: Arc<MessageFilter>,
    /// Present only when the bridge transport is running.
    pub bridge: Option<BridgeIntake>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/status", get(status_http))
        .route("/qr", get(qr_svg))
        .route("/filters", put(update_filters))
        .route("/bridge/events", post(bridge_events))
        .with_state(state)
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.port,
        "session": state.session.state().await.as_str(),
    }))
}

/// GET /status: session state, pairing code (raw and as QR data URL) and active filters.
async fn status_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let snapshot = state.session.snapshot().await;
    let qr_data_url = snapshot
        .pairing_artifact
        .as_deref()
        .and_then(|a| match pairing::svg_data_url(a) {
            Ok(url) => Some(url),
            Err(e) => {
                log::warn!("status: rendering pairing QR failed: {}", e);
                None
            }
        });
    Json(json!({
        "state": snapshot.state.as_str(),
        "hasPairingArtifact": snapshot.pairing_artifact.is_some(),
        "pairingArtifact": snapshot.pairing_artifact,
        "qrDataUrl": qr_data_url,
        "disconnectReason": snapshot.disconnect_reason,
        "changedAt": snapshot.changed_at.map(|t| t.to_rfc3339()),
        "filters": state.filter.filters().await,
    }))
}

/// GET /qr: the current pairing code as an SVG image; 404 when there is none.
async fn qr_svg(State(state): State<GatewayState>) -> Response {
    let Some(artifact) = state.session.pairing_artifact().await else {
        return (StatusCode::NOT_FOUND, "no pairing code available").into_response();
    };
    match pairing::render_svg(&artifact) {
        Ok(svg) => ([(header::CONTENT_TYPE, "image/svg+xml")], svg).into_response(),
        Err(e) => {
            log::warn!("qr: rendering pairing QR failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct FiltersBody {
    types: Vec<String>,
}

/// PUT /filters with `{"types": [...]}` replaces the accepted message types.
async fn update_filters(
    State(state): State<GatewayState>,
    Json(body): Json<FiltersBody>,
) -> Json<serde_json::Value> {
    let types: Vec<String> = body
        .types
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    state.filter.set_filters(types).await;
    Json(json!({ "filters": state.filter.filters().await }))
}

/// POST /bridge/events: verifies the optional secret, parses the event and queues it for the dispatcher.
async fn bridge_events(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(intake) = state.bridge.as_ref() else {
        return StatusCode::NOT_FOUND;
    };
    if let Some(ref expected) = intake.secret {
        let provided = headers
            .get(BRIDGE_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != expected.as_str() {
            return StatusCode::FORBIDDEN;
        }
    }
    let event: BridgeEvent = match serde_json::from_slice(&body) {
        Ok(e) => e,
        Err(e) => {
            log::debug!("bridge: rejecting malformed event: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if intake.events_tx.send(event.into()).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}
