//! Channel adapters for relaybot.
//!
//! Adapters are pure I/O: they turn platform events into `InboundMessage`s
//! and deliver `OutboundMessage`s. Ordering and backend calls live elsewhere.

mod traits;
mod types;
mod webchat;
mod whatsapp;

pub use traits::ChannelAdapter;
pub use types::{ChannelId, InboundMessage, MessageId, OutboundMessage, SenderId};
pub use webchat::WebChatAdapter;
pub use whatsapp::{WHATSAPP_WEBHOOK_PATH, WhatsAppCloudAdapter};
