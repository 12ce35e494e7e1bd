use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "whatsapp", "webchat".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send one message to a user on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Show a typing indicator to the user, optionally anchored to the
    /// message being answered. Adapters without one keep the default.
    async fn send_typing(&self, _recipient_id: &str, _reply_to: Option<&MessageId>) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    fn supports_typing_events(&self) -> bool {
        false
    }
}
