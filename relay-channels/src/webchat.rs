use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::{Result, anyhow};
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

/// Browser chat over a WebSocket at `/ws`. Each socket is one user; its
/// sender id is announced in a `hello` frame.
#[derive(Clone, Default)]
pub struct WebChatAdapter {
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    connections: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    fn push_frame(&self, recipient_id: &str, payload: serde_json::Value) -> Result<()> {
        let Some(conn) = self.connections.get(recipient_id) else {
            return Err(anyhow!(
                "webchat connection not found for recipient_id={recipient_id}"
            ));
        };
        conn.send(Message::Text(payload.to_string().into()))
            .map_err(|_| anyhow!("webchat send failed: socket closed"))
    }
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket) {
    let sender_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    adapter.connections.insert(sender_id.clone(), outbound_tx);

    let hello = serde_json::json!({ "type": "hello", "sender_id": sender_id });
    if ws_sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        adapter.connections.remove(&sender_id);
        return;
    }

    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Some(content) = parse_client_frame(&text) else {
            tracing::warn!(sender_id = %sender_id, "webchat frame ignored");
            continue;
        };

        let inbound = InboundMessage {
            message_id: Uuid::new_v4().to_string().into(),
            channel_id: "webchat".into(),
            sender_id: sender_id.clone().into(),
            content,
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        };

        let tx = adapter.inbound_tx.read().await.clone();
        let Some(tx) = tx else {
            tracing::error!(sender_id = %sender_id, "webchat adapter started without inbound queue");
            break;
        };
        if let Err(e) = tx.send(inbound).await {
            tracing::error!(%e, sender_id = %sender_id, "webchat inbound queue closed");
            break;
        }
    }

    outbound_task.abort();
    adapter.connections.remove(&sender_id);
}

/// Accepts `{"type":"message","content":"..."}` with non-blank content.
fn parse_client_frame(text: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(text).ok()?;
    if parsed.get("type").and_then(|v| v.as_str()) != Some("message") {
        return None;
    }
    parsed
        .get("content")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .map(ToOwned::to_owned)
}

#[async_trait::async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_id(&self) -> &str {
        "webchat"
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        self.push_frame(
            recipient_id,
            serde_json::json!({ "type": "message", "body": message.body }),
        )
    }

    async fn send_typing(&self, recipient_id: &str, _reply_to: Option<&MessageId>) -> Result<()> {
        self.push_frame(recipient_id, serde_json::json!({ "type": "typing" }))
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}
