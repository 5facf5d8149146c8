//! Messaging channels (Telegram, HTTP bridge).
//!
//! A channel connector reports lifecycle changes and inbound messages as `TransportEvent`s on an
//! mpsc channel, and is registered in the `ChannelRegistry` so the orchestrator can reply.

mod bridge;
mod inbound;
mod registry;
mod telegram;

pub use bridge::{BridgeChannel, BridgeEvent, BRIDGE_CHANNEL_ID, BRIDGE_SECRET_HEADER};
pub use inbound::{ConversationRef, InboundMessage, TransportEvent};
pub use registry::{ChannelError, ChannelHandle, ChannelRegistry};
pub use telegram::TelegramChannel;
