//! Intake multiplexer: every channel adapter feeds one inbound queue, and each
//! message is either answered as a command or handed to the user's drain loop.

use crate::commands::CommandRouter;
use crate::conversation::ConversationStore;
use crate::relay::{PendingItem, ReplyTarget};
use anyhow::{Result, anyhow};
use relay_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use relay_queue::{DrainDispatcher, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// What the gateway did with one inbound message.
#[derive(Debug)]
pub enum Intake {
    Ignored,
    /// Answered by the command router; `reply` delivers the answer.
    Command { reply: JoinHandle<()> },
    /// Queued for the user; `drain` is set when this message started the
    /// user's drain loop.
    Queued { drain: Option<JoinHandle<()>> },
}

pub struct Gateway {
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    commands: CommandRouter,
    conversations: Arc<ConversationStore>,
    dispatcher: Arc<DrainDispatcher<PendingItem>>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
}

impl Gateway {
    pub fn new(
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        commands: CommandRouter,
        conversations: Arc<ConversationStore>,
        dispatcher: Arc<DrainDispatcher<PendingItem>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            channels,
            commands,
            conversations,
            dispatcher,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run_loop(shutdown).await {
                tracing::error!(%e, "gateway loop exited");
            }
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(&self, shutdown: CancellationToken) -> Result<()> {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("gateway shutdown requested");
                        return Ok(());
                    }
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                tracing::info!("inbound queue closed; gateway stopping");
                return Ok(());
            };

            let message_id = inbound.message_id.clone();
            match self.handle_inbound(inbound).await {
                Ok(Intake::Queued { drain }) => {
                    tracing::debug!(
                        message_id = %message_id,
                        drain_started = drain.is_some(),
                        "message queued"
                    );
                }
                Ok(intake) => {
                    tracing::debug!(message_id = %message_id, intake = ?intake, "message handled");
                }
                Err(e) => tracing::warn!(%e, message_id = %message_id, "handle_inbound failed"),
            }
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel_id = %inbound.channel_id, sender_id = %inbound.sender_id)
    )]
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<Intake> {
        let channel = self
            .channels
            .get(inbound.channel_id.as_str())
            .ok_or_else(|| anyhow!("unknown channel: {}", inbound.channel_id))?
            .clone();

        if inbound.content.trim().is_empty() {
            tracing::debug!("blank message ignored");
            return Ok(Intake::Ignored);
        }

        // Command replies go out on their own task; a slow send must not hold
        // up intake for everyone else.
        if let Some(body) = self.commands.handle(&inbound.content) {
            let recipient = inbound.sender_id.to_string();
            let message = OutboundMessage {
                body,
                reply_to_message_id: Some(inbound.message_id.clone()),
            };
            let reply = tokio::spawn(
                async move {
                    if let Err(e) = channel.send(&recipient, message).await {
                        tracing::warn!(error = %e, "command reply failed");
                    }
                }
                .instrument(tracing::Span::current()),
            );
            return Ok(Intake::Command { reply });
        }

        let user = UserId::scoped(inbound.channel_id.as_str(), inbound.sender_id.as_str());
        let item = PendingItem {
            reply: ReplyTarget {
                channel,
                recipient_id: inbound.sender_id.to_string(),
                reply_to: inbound.message_id.clone(),
            },
            conversation: self.conversations.get_or_create(&user),
            inbound,
        };
        let drain = self.dispatcher.submit(user, item);
        Ok(Intake::Queued { drain })
    }
}
