//! Telegram channel: getMe handshake, long-poll getUpdates and sendMessage via Bot API.

use crate::channels::inbound::{ConversationRef, InboundMessage, TransportEvent};
use crate::channels::registry::{ChannelError, ChannelHandle};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<serde_json::Value>,
    #[serde(default)]
    pub video: Option<serde_json::Value>,
    #[serde(default)]
    pub document: Option<serde_json::Value>,
    #[serde(default)]
    pub audio: Option<serde_json::Value>,
    #[serde(default)]
    pub voice: Option<serde_json::Value>,
    #[serde(default)]
    pub sticker: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

impl TelegramMessage {
    /// Message-type tag used by the filter.
    fn kind(&self) -> &'static str {
        if self.text.is_some() {
            "text"
        } else if self.photo.is_some()
            || self.video.is_some()
            || self.document.is_some()
            || self.audio.is_some()
            || self.voice.is_some()
        {
            "media"
        } else if self.sticker.is_some() {
            "sticker"
        } else {
            "other"
        }
    }

    /// Convert to the channel-neutral form. `bot_id` marks messages the bot itself sent.
    pub fn into_inbound(self, channel_id: &str, bot_id: i64) -> InboundMessage {
        let kind = self.kind().to_string();
        let (sender, sender_name, from_me) = match &self.from {
            Some(u) => (
                u.id.to_string(),
                u.first_name.clone().or_else(|| u.username.clone()),
                u.id == bot_id,
            ),
            None => (self.chat.id.to_string(), None, false),
        };
        InboundMessage {
            channel_id: channel_id.to_string(),
            conversation: ConversationRef {
                chat_id: self.chat.id.to_string(),
                message_id: Some(self.message_id.to_string()),
            },
            sender,
            sender_name,
            body: self.text.or(self.caption).unwrap_or_default(),
            kind,
            from_me,
        }
    }
}

/// Telegram channel connector: long-polls for updates and replies via sendMessage.
pub struct TelegramChannel {
    id: String,
    token: String,
    api_base: String,
    running: AtomicBool,
    polling: AtomicBool,
    bot_id: AtomicI64,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: String) -> Self {
        Self {
            id: "telegram".to_string(),
            token,
            api_base: telegram_api_base(),
            running: AtomicBool::new(false),
            polling: AtomicBool::new(false),
            bot_id: AtomicI64::new(0),
            client: reqwest::Client::new(),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst) && self.running()
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Start the getMe handshake and the getUpdates loop, forwarding events to the dispatcher.
    /// Returns a handle to await on shutdown.
    pub fn start_inbound(self: Arc<Self>, events_tx: mpsc::Sender<TransportEvent>) -> JoinHandle<()> {
        self.running.store(true, Ordering::SeqCst);
        self.polling.store(true, Ordering::SeqCst);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, events_tx).await;
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, ChannelError> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api(format!("{} failed: {} {}", method, status, body)));
        }
        let data: ApiResponse<T> = res.json().await?;
        if !data.ok {
            return Err(ChannelError::Api(format!(
                "{} returned ok: false ({})",
                method,
                data.description.unwrap_or_default()
            )));
        }
        data.result
            .ok_or_else(|| ChannelError::Api(format!("{} returned no result", method)))
    }

    /// Call getMe; remembers the bot id so the bot's own messages can be recognised.
    async fn get_me(&self) -> Result<TelegramUser, ChannelError> {
        let me: TelegramUser = self.call("getMe", serde_json::json!({})).await?;
        self.bot_id.store(me.id, Ordering::SeqCst);
        Ok(me)
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), ChannelError> {
        let mut body = serde_json::json!({ "timeout": LONG_POLL_TIMEOUT });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", body).await?;
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }

    /// Send a text message to a chat via sendMessage, quoting the original message when known.
    pub async fn send_message(
        &self,
        conversation: &ConversationRef,
        text: &str,
    ) -> Result<(), ChannelError> {
        if !self.running() {
            return Err(ChannelError::Stopped);
        }
        let mut body = serde_json::json!({ "chat_id": conversation.chat_id, "text": text });
        if let Some(id) = conversation
            .message_id
            .as_deref()
            .and_then(|m| m.parse::<i64>().ok())
        {
            body["reply_to_message_id"] = serde_json::Value::from(id);
            body["allow_sending_without_reply"] = serde_json::Value::Bool(true);
        }
        let _: serde_json::Value = self.call("sendMessage", body).await?;
        Ok(())
    }
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, events_tx: mpsc::Sender<TransportEvent>) {
    match channel.get_me().await {
        Ok(me) => {
            log::info!(
                "telegram channel: authenticated as @{}",
                me.username.as_deref().unwrap_or("?")
            );
            if events_tx.send(TransportEvent::Ready).await.is_err() {
                return;
            }
        }
        Err(e) => {
            log::error!("telegram getMe failed: {}", e);
            channel.running.store(false, Ordering::SeqCst);
            let _ = events_tx.send(TransportEvent::Disconnected(e.to_string())).await;
            return;
        }
    }

    let bot_id = channel.bot_id.load(Ordering::SeqCst);
    let mut offset: Option<i64> = None;
    while channel.polling() {
        match channel.get_updates(offset).await {
            Ok((updates, next)) => {
                offset = next.or(offset);
                for u in updates {
                    let Some(msg) = u.message else { continue };
                    let inbound = msg.into_inbound(&channel.id, bot_id);
                    if events_tx.send(TransportEvent::Message(inbound)).await.is_err() {
                        log::debug!("telegram: event channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::time::sleep(tokio::time::Duration::from_secs(2)).await;
            }
        }
    }
    let _ = events_tx
        .send(TransportEvent::Disconnected("channel stopped".to_string()))
        .await;
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop_intake(&self) {
        self.polling.store(false, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.polling.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    async fn reply(&self, conversation: &ConversationRef, text: &str) -> Result<(), ChannelError> {
        self.send_message(conversation, text).await
    }
}

/// Resolve Telegram bot API base URL (TELEGRAM_API_BASE for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE")
        .map(|u| u.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}
