//! Message log: one record per handled inbound message, later updated with the generated reply.

mod sqlite;

use crate::channels::InboundMessage;
use async_trait::async_trait;
use std::sync::Arc;

pub use sqlite::SqliteStore;

/// Stored when the transport does not report a display name.
pub const UNKNOWN_SENDER_NAME: &str = "unknown";

/// Opaque record identifier returned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fields written when a message is first recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub from_number: String,
    pub from_name: String,
    pub text: String,
    pub message_type: String,
}

impl From<&InboundMessage> for NewMessage {
    fn from(msg: &InboundMessage) -> Self {
        Self {
            from_number: msg.sender.clone(),
            from_name: msg
                .sender_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_SENDER_NAME.to_string()),
            text: msg.body.clone(),
            message_type: msg.kind.clone(),
        }
    }
}

/// A persisted message as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: RecordId,
    pub from_number: String,
    pub from_name: Option<String>,
    pub text: String,
    pub message_type: String,
    pub timestamp: String,
    pub generated_response: Option<String>,
    pub response_sent: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("no message record with id {0}")]
    NotFound(RecordId),
    #[error("store is closed")]
    Closed,
}

/// Durable storage capability.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a new record (no response yet) and return its id.
    async fn record_message(&self, message: NewMessage) -> Result<RecordId, StoreError>;

    /// Set the generated response and mark it sent.
    async fn attach_response(&self, id: RecordId, text: &str) -> Result<(), StoreError>;

    /// Release the underlying resources. Later calls fail with `StoreError::Closed`.
    async fn close(&self);
}

/// What the orchestrator sees of storage: inbound messages in, record ids out.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn MessageStore>,
}

impl Persistence {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub async fn record_message(&self, msg: &InboundMessage) -> Result<RecordId, StoreError> {
        let id = self.store.record_message(NewMessage::from(msg)).await?;
        log::debug!("store: recorded message {} from {}", id, msg.sender);
        Ok(id)
    }

    pub async fn attach_response(&self, id: RecordId, text: &str) -> Result<(), StoreError> {
        self.store.attach_response(id, text).await
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
