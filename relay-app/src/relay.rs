//! The per-message step the drain loop runs: typing signal, one backend call,
//! then the reply delivered paragraph by paragraph.

use crate::conversation::ConversationHandle;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use regex::Regex;
use relay_channels::{ChannelAdapter, InboundMessage, MessageId, OutboundMessage};
use relay_llm::AssistantsClient;
use relay_queue::{ItemProcessor, UserId};
use std::sync::Arc;

/// Where replies for one inbound message go.
#[derive(Clone)]
pub struct ReplyTarget {
    pub channel: Arc<dyn ChannelAdapter>,
    pub recipient_id: String,
    pub reply_to: MessageId,
}

/// One queued message with everything needed to answer it.
#[derive(Clone)]
pub struct PendingItem {
    pub inbound: InboundMessage,
    pub reply: ReplyTarget,
    pub conversation: ConversationHandle,
}

#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Sends `text` into the user's conversation and returns the full reply.
    async fn ask(
        &self,
        assistant_id: &str,
        text: &str,
        conversation: &ConversationHandle,
    ) -> Result<String>;
}

#[async_trait]
impl AssistantBackend for AssistantsClient {
    async fn ask(
        &self,
        assistant_id: &str,
        text: &str,
        conversation: &ConversationHandle,
    ) -> Result<String> {
        let mut conversation = conversation.lock().await;
        let reply =
            AssistantsClient::ask(self, assistant_id, text, &mut conversation.thread).await?;
        conversation.record_exchange();
        tracing::debug!(
            thread_id = ?conversation.thread.thread_id,
            exchanges = conversation.exchanges,
            last_active = ?conversation.last_active,
            "conversation updated"
        );
        Ok(reply)
    }
}

/// Splits assistant replies into chat-sized paragraphs and strips the
/// `【…】` citation markers file search leaves behind.
#[derive(Debug, Clone)]
pub struct ReplyFormatter {
    paragraph_break: Regex,
    citation: Regex,
}

impl ReplyFormatter {
    pub fn new() -> Result<Self> {
        let paragraph_break = Regex::new(r"\r?\n(?:[ \t]*\r?\n)+")
            .map_err(|e| anyhow!("invalid paragraph pattern: {e}"))?;
        let citation = Regex::new(r"[ \t]*【[^】]*】")
            .map_err(|e| anyhow!("invalid citation pattern: {e}"))?;
        Ok(Self {
            paragraph_break,
            citation,
        })
    }

    pub fn split(&self, reply: &str) -> Vec<String> {
        self.paragraph_break
            .split(reply)
            .map(|paragraph| self.citation.replace_all(paragraph, ""))
            .map(|paragraph| paragraph.trim().to_string())
            .filter(|paragraph| !paragraph.is_empty())
            .collect()
    }
}

pub struct RelayProcessor {
    backend: Arc<dyn AssistantBackend>,
    assistant_id: String,
    typing_indicator: bool,
    formatter: ReplyFormatter,
}

impl RelayProcessor {
    pub fn new(
        backend: Arc<dyn AssistantBackend>,
        assistant_id: impl Into<String>,
        typing_indicator: bool,
    ) -> Result<Self> {
        Ok(Self {
            backend,
            assistant_id: assistant_id.into(),
            typing_indicator,
            formatter: ReplyFormatter::new()?,
        })
    }

    async fn signal_typing(&self, target: &ReplyTarget) {
        if !target.channel.supports_typing_events() {
            return;
        }
        if let Err(e) = target
            .channel
            .send_typing(&target.recipient_id, Some(&target.reply_to))
            .await
        {
            tracing::debug!(error = %e, "typing indicator failed; continuing");
        }
    }
}

#[async_trait]
impl ItemProcessor<PendingItem> for RelayProcessor {
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(user_id = %user, message_id = %item.inbound.message_id)
    )]
    async fn process(&self, user: &UserId, item: &PendingItem) -> Result<()> {
        if self.typing_indicator {
            self.signal_typing(&item.reply).await;
        }

        let reply = self
            .backend
            .ask(&self.assistant_id, &item.inbound.content, &item.conversation)
            .await?;

        let paragraphs = self.formatter.split(&reply);
        if paragraphs.is_empty() {
            tracing::warn!("assistant reply had nothing to send");
            return Ok(());
        }

        // Stop at the first failed send so a reply never arrives with a gap.
        let total = paragraphs.len();
        for (index, body) in paragraphs.into_iter().enumerate() {
            item.reply
                .channel
                .send(&item.reply.recipient_id, OutboundMessage::text(body))
                .await
                .map_err(|e| anyhow!("send paragraph {}/{total} failed: {e}", index + 1))?;
        }
        tracing::debug!(paragraphs = total, "reply delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationStore;
    use crate::testing::{RecordingChannel, ScriptedBackend, inbound};
    use tokio::sync::Mutex;

    fn pending(channel: Arc<dyn ChannelAdapter>, content: &str) -> PendingItem {
        let store = ConversationStore::new();
        PendingItem {
            inbound: inbound("fake", "alice", "m1", content),
            reply: ReplyTarget {
                channel,
                recipient_id: "alice".to_string(),
                reply_to: MessageId::from("m1"),
            },
            conversation: store.get_or_create(&UserId::from("fake:alice")),
        }
    }

    #[test]
    fn splits_paragraphs_and_strips_citations() {
        let formatter = ReplyFormatter::new().expect("patterns compile");
        assert_eq!(
            formatter.split("Hello there.\n\n【citation】 World."),
            vec!["Hello there.".to_string(), "World.".to_string()]
        );
    }

    #[test]
    fn split_handles_crlf_blank_runs_and_citation_only_paragraphs() {
        let formatter = ReplyFormatter::new().expect("patterns compile");
        let reply = "One\r\n \r\n\r\nTwo has a source 【4:0†notes.md】.\n\n【1:2†src】\n\nThree\nstill three";
        assert_eq!(
            formatter.split(reply),
            vec![
                "One".to_string(),
                "Two has a source.".to_string(),
                "Three\nstill three".to_string(),
            ]
        );
        assert!(formatter.split("  \n\n【x】").is_empty());
    }

    #[tokio::test]
    async fn typing_then_backend_then_paragraphs_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(RecordingChannel::with_events(events.clone()));
        let backend = Arc::new(ScriptedBackend::replying(
            "Hello there.\n\n【citation】 World.",
            events.clone(),
        ));
        let processor = RelayProcessor::new(backend.clone(), "asst_1", true).expect("processor");

        processor
            .process(&UserId::from("fake:alice"), &pending(channel, "hi"))
            .await
            .expect("processed");

        assert_eq!(
            *events.lock().await,
            vec![
                "typing:m1".to_string(),
                "ask:hi".to_string(),
                "send:Hello there.".to_string(),
                "send:World.".to_string(),
            ]
        );
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn each_paragraph_waits_for_the_previous_send() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(
            RecordingChannel::with_events(events.clone())
                .with_send_delay(std::time::Duration::from_millis(20)),
        );
        let backend = Arc::new(ScriptedBackend::replying(
            "first\n\nsecond\n\nthird\n\nfourth",
            events.clone(),
        ));
        let processor = RelayProcessor::new(backend, "asst_1", false).expect("processor");

        processor
            .process(&UserId::from("fake:alice"), &pending(channel.clone(), "hi"))
            .await
            .expect("processed");

        assert_eq!(channel.max_sends_in_flight(), 1);
        assert_eq!(
            channel.sent_bodies().await,
            vec!["first", "second", "third", "fourth"]
        );
    }

    #[tokio::test]
    async fn failed_send_stops_remaining_paragraphs() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(RecordingChannel::with_events(events.clone()).failing_send_at(2));
        let backend = Arc::new(ScriptedBackend::replying("a\n\nb\n\nc", events.clone()));
        let processor = RelayProcessor::new(backend, "asst_1", false).expect("processor");

        let result = processor
            .process(&UserId::from("fake:alice"), &pending(channel.clone(), "hi"))
            .await;

        assert!(result.is_err());
        assert_eq!(channel.sent_bodies().await, vec!["a".to_string()]);
        assert_eq!(channel.send_attempts(), 2);
    }

    #[tokio::test]
    async fn typing_failure_does_not_block_reply() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(RecordingChannel::with_events(events.clone()).failing_typing());
        let backend = Arc::new(ScriptedBackend::replying("ok", events.clone()));
        let processor = RelayProcessor::new(backend, "asst_1", true).expect("processor");

        processor
            .process(&UserId::from("fake:alice"), &pending(channel.clone(), "hi"))
            .await
            .expect("processed");

        assert_eq!(channel.sent_bodies().await, vec!["ok".to_string()]);
    }

    #[tokio::test]
    async fn backend_error_sends_nothing() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(RecordingChannel::with_events(events.clone()));
        let backend = Arc::new(ScriptedBackend::failing("run failed", events.clone()));
        let processor = RelayProcessor::new(backend, "asst_1", false).expect("processor");

        let result = processor
            .process(&UserId::from("fake:alice"), &pending(channel.clone(), "hi"))
            .await;

        assert!(result.is_err());
        assert_eq!(channel.send_attempts(), 0);
    }
}
