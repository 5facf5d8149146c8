//! SQLite-backed message store (rusqlite). Calls run on the blocking pool.

use crate::store::{MessageRecord, MessageStore, NewMessage, RecordId, StoreError};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS messages (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    from_number        TEXT NOT NULL,
    from_name          TEXT,
    message_text       TEXT NOT NULL,
    message_type       TEXT NOT NULL,
    timestamp          DATETIME DEFAULT CURRENT_TIMESTAMP,
    generated_response TEXT,
    response_sent      BOOLEAN NOT NULL DEFAULT 0
);";

pub struct SqliteStore {
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStore {
    /// Open (creating parent directories and the schema if needed).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        log::info!("store: opened sqlite database at {}", path.display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Closed)?;
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await?
    }

    /// Read one record back.
    pub async fn fetch(&self, id: RecordId) -> Result<Option<MessageRecord>, StoreError> {
        self.run(move |conn| {
            let record = conn
                .query_row(
                    "SELECT id, from_number, from_name, message_text, message_type, timestamp,
                            generated_response, response_sent
                     FROM messages WHERE id = ?1",
                    params![id.0],
                    |row| {
                        Ok(MessageRecord {
                            id: RecordId(row.get(0)?),
                            from_number: row.get(1)?,
                            from_name: row.get(2)?,
                            text: row.get(3)?,
                            message_type: row.get(4)?,
                            timestamp: row.get(5)?,
                            generated_response: row.get(6)?,
                            response_sent: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn record_message(&self, message: NewMessage) -> Result<RecordId, StoreError> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO messages (from_number, from_name, message_text, message_type)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    message.from_number,
                    message.from_name,
                    message.text,
                    message.message_type
                ],
            )?;
            Ok(RecordId(conn.last_insert_rowid()))
        })
        .await
    }

    async fn attach_response(&self, id: RecordId, text: &str) -> Result<(), StoreError> {
        let text = text.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE messages SET generated_response = ?1, response_sent = 1 WHERE id = ?2",
                params![text, id.0],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) {
        let conn = self.conn.clone();
        let closed = tokio::task::spawn_blocking(move || {
            let Ok(mut guard) = conn.lock() else { return };
            if let Some(c) = guard.take() {
                if let Err((_, e)) = c.close() {
                    log::warn!("store: closing sqlite connection failed: {}", e);
                }
            }
        })
        .await;
        if let Err(e) = closed {
            log::warn!("store: close task failed: {}", e);
        }
        log::info!("store: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NewMessage {
        NewMessage {
            from_number: "5511999999999@c.us".to_string(),
            from_name: "Ana".to_string(),
            text: "hello".to_string(),
            message_type: "text".to_string(),
        }
    }

    #[tokio::test]
    async fn record_starts_without_response() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.record_message(sample()).await.unwrap();
        let rec = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(rec.id, id);
        assert_eq!(rec.from_number, "5511999999999@c.us");
        assert_eq!(rec.from_name.as_deref(), Some("Ana"));
        assert_eq!(rec.text, "hello");
        assert_eq!(rec.message_type, "text");
        assert!(!rec.timestamp.is_empty());
        assert_eq!(rec.generated_response, None);
        assert!(!rec.response_sent);
    }

    #[tokio::test]
    async fn attach_sets_response_and_flag() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.record_message(sample()).await.unwrap();
        store.attach_response(id, "hi there").await.unwrap();
        let rec = store.fetch(id).await.unwrap().unwrap();
        assert_eq!(rec.generated_response.as_deref(), Some("hi there"));
        assert!(rec.response_sent);
    }

    #[tokio::test]
    async fn ids_are_distinct() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.record_message(sample()).await.unwrap();
        let b = store.record_message(sample()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn attach_unknown_id_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.attach_response(RecordId(404), "x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(RecordId(404))));
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.close().await;
        assert!(matches!(
            store.record_message(sample()).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(
            store.attach_response(RecordId(1), "x").await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!("parley-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("messages.db");
        let store = SqliteStore::open(&path).unwrap();
        store.record_message(sample()).await.unwrap();
        store.close().await;
        assert!(path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
