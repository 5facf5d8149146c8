//! Events delivered by a channel connector to the dispatch loop.

/// Where a reply goes: the chat plus, when the transport supports quoting, the message being answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRef {
    pub chat_id: String,
    pub message_id: Option<String>,
}

/// A message from a channel, handled by at most one pipeline run and dropped afterwards.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub conversation: ConversationRef,
    /// Sender identifier (phone number, user id).
    pub sender: String,
    pub sender_name: Option<String>,
    pub body: String,
    /// Message-type tag as reported by the transport ("text", "chat", "media", ...).
    pub kind: String,
    /// True when the session itself sent the message.
    pub from_me: bool,
}

/// Everything a transport reports: lifecycle changes and inbound messages, in order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    PairingArtifact(String),
    Ready,
    Disconnected(String),
    Message(InboundMessage),
}
