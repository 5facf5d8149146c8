//! Session lifecycle tracker: connection state of the messaging session and the latest pairing artifact.
//!
//! Transports report lifecycle events here; the gateway reads snapshots for the status page and
//! the orchestrator may consult the state before handling a message. Events are applied in
//! whatever order they arrive; no transition is rejected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Connection state of the messaging session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Unauthenticated,
    AwaitingPairing,
    Connected,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::AwaitingPairing => "awaiting_pairing",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
        }
    }
}

/// Point-in-time copy of the tracker, for observers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub pairing_artifact: Option<String>,
    pub disconnect_reason: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Inner {
    state: SessionState,
    pairing_artifact: Option<String>,
    disconnect_reason: Option<String>,
    changed_at: Option<DateTime<Utc>>,
}

/// Process-wide session state. Shared by `Arc` between the dispatch loop, pipelines and the gateway.
#[derive(Debug, Default)]
pub struct SessionTracker {
    inner: RwLock<Inner>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pairing artifact (e.g. QR payload) is available: now awaiting pairing.
    pub async fn on_pairing_artifact(&self, artifact: impl Into<String>) {
        let mut g = self.inner.write().await;
        g.state = SessionState::AwaitingPairing;
        g.pairing_artifact = Some(artifact.into());
        g.changed_at = Some(Utc::now());
        log::info!("session: pairing code received, waiting for the device to be linked");
    }

    /// The session is authenticated and ready. Any stored artifact is stale and dropped.
    pub async fn on_ready(&self) {
        let mut g = self.inner.write().await;
        g.state = SessionState::Connected;
        g.pairing_artifact = None;
        g.changed_at = Some(Utc::now());
        log::info!("session: connected");
    }

    /// The session went away. Clears the artifact and keeps the reason for diagnostics.
    pub async fn on_disconnected(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut g = self.inner.write().await;
        g.state = SessionState::Disconnected;
        g.pairing_artifact = None;
        g.changed_at = Some(Utc::now());
        log::warn!("session: disconnected: {}", reason);
        g.disconnect_reason = Some(reason);
    }

    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    pub async fn pairing_artifact(&self) -> Option<String> {
        self.inner.read().await.pairing_artifact.clone()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let g = self.inner.read().await;
        SessionSnapshot {
            state: g.state,
            pairing_artifact: g.pairing_artifact.clone(),
            disconnect_reason: g.disconnect_reason.clone(),
            changed_at: g.changed_at,
        }
    }
}
