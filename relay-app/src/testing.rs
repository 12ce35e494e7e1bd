//! Recording fakes shared by the relay-app tests.

use crate::conversation::{ConversationHandle, ConversationStore};
use crate::relay::{AssistantBackend, PendingItem, RelayProcessor, ReplyTarget};
use crate::server::RelayState;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::body::to_bytes;
use chrono::Utc;
use relay_channels::{ChannelAdapter, InboundMessage, MessageId, OutboundMessage};
use relay_queue::{DeadLetterLog, DrainDispatcher, FailurePolicy, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};

pub fn inbound(channel: &str, sender: &str, message_id: &str, content: &str) -> InboundMessage {
    InboundMessage {
        message_id: message_id.into(),
        channel_id: channel.into(),
        sender_id: sender.into(),
        content: content.to_string(),
        metadata: serde_json::Value::Null,
        received_at: Utc::now(),
    }
}

/// Channel that records every typing signal and send as a line of text.
#[derive(Default)]
pub struct RecordingChannel {
    pub events: Arc<Mutex<Vec<String>>>,
    /// 1-based send attempt that fails; `None` never fails.
    fail_send_at: Option<usize>,
    fail_typing: bool,
    /// Each send sleeps this long before it completes.
    send_delay: Option<Duration>,
    send_attempts: AtomicUsize,
    sends_in_flight: AtomicUsize,
    max_sends_in_flight: AtomicUsize,
}

impl RecordingChannel {
    pub fn with_events(events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn failing_send_at(mut self, attempt: usize) -> Self {
        self.fail_send_at = Some(attempt);
        self
    }

    pub fn failing_typing(mut self) -> Self {
        self.fail_typing = true;
        self
    }

    pub fn with_send_delay(mut self, delay: Duration) -> Self {
        self.send_delay = Some(delay);
        self
    }

    pub fn max_sends_in_flight(&self) -> usize {
        self.max_sends_in_flight.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    pub async fn sent_bodies(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|event| event.strip_prefix("send:"))
            .map(ToOwned::to_owned)
            .collect()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingChannel {
    fn channel_id(&self) -> &str {
        "fake"
    }

    async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        Ok(())
    }

    async fn send(&self, _recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let attempt = self.send_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.sends_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_sends_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.send_delay {
            tokio::time::sleep(delay).await;
        }
        self.sends_in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.fail_send_at == Some(attempt) {
            return Err(anyhow!("send attempt {attempt} rejected"));
        }
        self.events
            .lock()
            .await
            .push(format!("send:{}", message.body));
        Ok(())
    }

    async fn send_typing(&self, _recipient_id: &str, reply_to: Option<&MessageId>) -> Result<()> {
        if self.fail_typing {
            return Err(anyhow!("typing rejected"));
        }
        let anchor = reply_to.map(MessageId::as_str).unwrap_or("-");
        self.events.lock().await.push(format!("typing:{anchor}"));
        Ok(())
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}

/// Backend that answers every question with the same reply.
pub struct ScriptedBackend {
    reply: Result<String, String>,
    pub events: Arc<Mutex<Vec<String>>>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn replying(reply: &str, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            events,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: &str, events: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            reply: Err(error.to_string()),
            events,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AssistantBackend for ScriptedBackend {
    async fn ask(
        &self,
        _assistant_id: &str,
        text: &str,
        conversation: &ConversationHandle,
    ) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().await.push(format!("ask:{text}"));
        conversation.lock().await.record_exchange();
        self.reply.clone().map_err(|e| anyhow!(e))
    }
}

pub fn pending_item(sender: &str, message_id: &str, content: &str) -> PendingItem {
    let channel: Arc<dyn ChannelAdapter> = Arc::new(RecordingChannel::default());
    PendingItem {
        inbound: inbound("fake", sender, message_id, content),
        reply: ReplyTarget {
            channel,
            recipient_id: sender.to_string(),
            reply_to: MessageId::from(message_id),
        },
        conversation: ConversationStore::new().get_or_create(&UserId::scoped("fake", sender)),
    }
}

pub fn relay_state() -> Arc<RelayState> {
    relay_state_with_channel().0
}

/// Server state with one recording channel registered as `fake`.
pub fn relay_state_with_channel() -> (Arc<RelayState>, Arc<RecordingChannel>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let channel = Arc::new(RecordingChannel::with_events(events.clone()));
    let backend = Arc::new(ScriptedBackend::replying("ok", events));
    let processor =
        Arc::new(RelayProcessor::new(backend, "asst_test", false).expect("processor"));
    let dispatcher: Arc<DrainDispatcher<PendingItem>> = Arc::new(DrainDispatcher::new(
        processor,
        FailurePolicy::DeadLetter,
        Arc::new(DeadLetterLog::new(8)),
    ));

    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    channels.insert("fake".to_string(), channel.clone());
    let state = Arc::new(RelayState {
        started_at: Instant::now(),
        channels,
        dispatcher,
        conversations: Arc::new(ConversationStore::new()),
    });
    (state, channel)
}

pub async fn response_body_json(response: axum::response::Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body");
    serde_json::from_slice(&body).expect("response json")
}
