//! Bridge channel: a session client running out of process (e.g. a WhatsApp Web sidecar).
//!
//! The sidecar POSTs lifecycle and message events to the gateway (`/bridge/events`) and
//! receives replies as POSTs to `<url>/reply`.

use crate::channels::inbound::{ConversationRef, InboundMessage, TransportEvent};
use crate::channels::registry::{ChannelError, ChannelHandle};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};

pub const BRIDGE_CHANNEL_ID: &str = "bridge";

/// Header carrying the shared secret on event POSTs.
pub const BRIDGE_SECRET_HEADER: &str = "x-parley-bridge-secret";

/// Event body posted by the sidecar.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum BridgeEvent {
    Qr {
        data: String,
    },
    Ready,
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    Message(BridgeMessage),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    /// Transport message id, used to quote the reply.
    #[serde(default)]
    pub id: Option<String>,
    /// Chat the message arrived in; replies go here.
    pub from: String,
    #[serde(default)]
    pub notify_name: Option<String>,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub from_me: bool,
}

impl From<BridgeEvent> for TransportEvent {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Qr { data } => TransportEvent::PairingArtifact(data),
            BridgeEvent::Ready => TransportEvent::Ready,
            BridgeEvent::Disconnected { reason } => {
                TransportEvent::Disconnected(reason.unwrap_or_else(|| "unknown".to_string()))
            }
            BridgeEvent::Message(m) => TransportEvent::Message(InboundMessage {
                channel_id: BRIDGE_CHANNEL_ID.to_string(),
                conversation: ConversationRef {
                    chat_id: m.from.clone(),
                    message_id: m.id,
                },
                sender: m.from,
                sender_name: m.notify_name.filter(|n| !n.trim().is_empty()),
                body: m.body,
                kind: m.kind,
                from_me: m.from_me,
            }),
        }
    }
}

/// Outbound side of the bridge: replies are POSTed back to the sidecar.
pub struct BridgeChannel {
    url: String,
    running: AtomicBool,
    client: reqwest::Client,
}

impl BridgeChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into().trim_end_matches('/').to_string(),
            running: AtomicBool::new(true),
            client: reqwest::Client::new(),
        }
    }

    /// POST <url>/reply with the target chat, the quoted message id and the text.
    pub async fn send_reply(
        &self,
        conversation: &ConversationRef,
        text: &str,
    ) -> Result<(), ChannelError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ChannelError::Stopped);
        }
        let url = format!("{}/reply", self.url);
        let body = serde_json::json!({
            "to": conversation.chat_id,
            "quotedMessageId": conversation.message_id,
            "text": text,
        });
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api(format!("bridge reply failed: {} {}", status, body)));
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelHandle for BridgeChannel {
    fn id(&self) -> &str {
        BRIDGE_CHANNEL_ID
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn reply(&self, conversation: &ConversationRef, text: &str) -> Result<(), ChannelError> {
        self.send_reply(conversation, text).await
    }
}
