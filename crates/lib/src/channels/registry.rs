//! Channel registry: register and lookup channels by id.

use crate::channels::inbound::ConversationRef;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel request failed: {0}")]
    Request(reqwest::Error),
    #[error("channel api error: {0}")]
    Api(String),
    #[error("channel not registered: {0}")]
    NotRegistered(String),
    #[error("channel stopped")]
    Stopped,
}

/// Bot API URLs embed the token, so they are dropped from the error.
impl From<reqwest::Error> for ChannelError {
    fn from(e: reqwest::Error) -> Self {
        ChannelError::Request(e.without_url())
    }
}

/// Handle to a running channel (stop, reply).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "telegram").
    fn id(&self) -> &str;
    /// Stop receiving inbound messages; replies keep working until `stop`.
    fn stop_intake(&self) {}
    /// Stop the channel connector.
    fn stop(&self);
    /// Send a text reply into a conversation.
    async fn reply(&self, conversation: &ConversationRef, text: &str) -> Result<(), ChannelError>;
}

/// Registry of channel ids to handles. Shared across the service.
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandle>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn register(&self, id: String, handle: Arc<dyn ChannelHandle>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(id.clone(), handle) {
            old.stop();
        }
    }

    pub async fn get(&self, id: &str) -> Option<Arc<dyn ChannelHandle>> {
        let g = self.inner.read().await;
        g.get(id).cloned()
    }

    /// Reply through the channel registered under `channel_id`.
    pub async fn reply(
        &self,
        channel_id: &str,
        conversation: &ConversationRef,
        text: &str,
    ) -> Result<(), ChannelError> {
        let handle = self
            .get(channel_id)
            .await
            .ok_or_else(|| ChannelError::NotRegistered(channel_id.to_string()))?;
        handle.reply(conversation, text).await
    }

    /// Stop inbound intake on every registered channel.
    pub async fn stop_intake_all(&self) {
        let g = self.inner.read().await;
        for handle in g.values() {
            handle.stop_intake();
        }
    }

    /// Stop every registered channel.
    pub async fn stop_all(&self) {
        let g = self.inner.read().await;
        for handle in g.values() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        stopped: AtomicBool,
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelHandle for Recorder {
        fn id(&self) -> &str {
            "test"
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn reply(&self, conversation: &ConversationRef, text: &str) -> Result<(), ChannelError> {
            self.sent
                .lock()
                .unwrap()
                .push((conversation.chat_id.clone(), text.to_string()));
            Ok(())
        }
    }

    fn conv() -> ConversationRef {
        ConversationRef {
            chat_id: "42".to_string(),
            message_id: None,
        }
    }

    #[tokio::test]
    async fn reply_routes_to_registered_channel() {
        let registry = ChannelRegistry::new();
        let rec = Arc::new(Recorder::default());
        registry.register("test".to_string(), rec.clone()).await;
        registry.reply("test", &conv(), "hi").await.unwrap();
        assert_eq!(
            rec.sent.lock().unwrap().as_slice(),
            &[("42".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn reply_to_unknown_channel_fails() {
        let registry = ChannelRegistry::new();
        let err = registry.reply("nope", &conv(), "hi").await.unwrap_err();
        assert!(matches!(err, ChannelError::NotRegistered(id) if id == "nope"));
    }

    #[tokio::test]
    async fn re_register_stops_previous_handle() {
        let registry = ChannelRegistry::new();
        let first = Arc::new(Recorder::default());
        registry.register("test".to_string(), first.clone()).await;
        registry
            .register("test".to_string(), Arc::new(Recorder::default()))
            .await;
        assert!(first.stopped.load(Ordering::SeqCst));
        registry.reply("test", &conv(), "hi").await.unwrap();
        assert!(first.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_errors_drop_the_url() {
        let err: ChannelError = reqwest::Client::new()
            .post("http://127.0.0.1:1/botSECRET-TOKEN/getMe")
            .send()
            .await
            .unwrap_err()
            .into();
        let text = format!("{} {:?}", err, err);
        assert!(!text.contains("SECRET-TOKEN"), "token leaked: {}", text);
    }

    #[tokio::test]
    async fn stopping_intake_keeps_replies_open() {
        let registry = ChannelRegistry::new();
        let rec = Arc::new(Recorder::default());
        registry.register("test".to_string(), rec.clone()).await;
        registry.stop_intake_all().await;
        assert!(!rec.stopped.load(Ordering::SeqCst));
        registry.reply("test", &conv(), "late").await.unwrap();
        registry.stop_all().await;
        assert!(rec.stopped.load(Ordering::SeqCst));
    }
}
