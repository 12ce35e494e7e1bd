use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::{Result, anyhow};
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

pub const WHATSAPP_WEBHOOK_PATH: &str = "/api/v1/relay/channels/whatsapp/webhook";

const DEFAULT_GRAPH_API_BASE_URL: &str = "https://graph.facebook.com/v20.0";

/// WhatsApp Cloud API adapter. Inbound messages arrive through the webhook
/// router returned by [`WhatsAppCloudAdapter::webhook_router`].
#[derive(Clone)]
pub struct WhatsAppCloudAdapter {
    http: reqwest::Client,
    access_token: String,
    phone_number_id: String,
    api_base_url: String,
    verify_token: String,
    app_secret: Option<String>,
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<InboundMessage>>>>,
}

impl WhatsAppCloudAdapter {
    pub fn new(access_token: &str, phone_number_id: &str) -> Result<Self> {
        let access_token = access_token.trim();
        if access_token.is_empty() {
            return Err(anyhow!("whatsapp access token is required"));
        }
        let phone_number_id = phone_number_id.trim();
        if phone_number_id.is_empty() {
            return Err(anyhow!("whatsapp phone number id is required"));
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
            api_base_url: DEFAULT_GRAPH_API_BASE_URL.to_string(),
            verify_token: String::new(),
            app_secret: None,
            inbound_tx: Arc::new(RwLock::new(None)),
        })
    }

    pub fn with_api_base_url(mut self, api_base_url: Option<String>) -> Self {
        if let Some(url) = api_base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            self.api_base_url = url.trim_end_matches('/').to_string();
        }
        self
    }

    /// Webhook credentials: the token Meta echoes during subscription and the
    /// optional app secret used to check `x-hub-signature-256`.
    pub fn with_webhook(mut self, verify_token: &str, app_secret: Option<String>) -> Self {
        self.verify_token = verify_token.trim().to_string();
        self.app_secret = app_secret
            .as_deref()
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn webhook_router(self: Arc<Self>) -> Router {
        Router::new()
            .route(
                WHATSAPP_WEBHOOK_PATH,
                get(webhook_verify).post(webhook_ingest),
            )
            .with_state(self)
    }

    fn messages_url(&self) -> String {
        format!("{}/{}/messages", self.api_base_url, self.phone_number_id)
    }

    async fn post_message(&self, payload: serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.access_token)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(anyhow!(
                "whatsapp request failed: status={} body={}",
                status,
                body
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WhatsAppCloudAdapter {
    fn channel_id(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        let to = recipient_id.trim();
        if to.is_empty() {
            return Err(anyhow!("recipient_id (E.164 phone number) is required"));
        }
        let text = message.body.trim();
        if text.is_empty() {
            return Err(anyhow!("message body is empty"));
        }

        let mut payload = serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": {
                "preview_url": false,
                "body": text,
            }
        });
        if let Some(reply_to) = message.reply_to_message_id {
            payload["context"] = serde_json::json!({ "message_id": reply_to.as_str() });
        }
        self.post_message(payload).await
    }

    async fn send_typing(&self, _recipient_id: &str, reply_to: Option<&MessageId>) -> Result<()> {
        let Some(message_id) = reply_to else {
            return Err(anyhow!(
                "whatsapp typing indicator needs the inbound message id"
            ));
        };
        // Marks the message read and shows "typing…" until the reply lands.
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id.as_str(),
            "typing_indicator": { "type": "text" },
        }))
        .await
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn webhook_verify(
    State(adapter): State<Arc<WhatsAppCloudAdapter>>,
    Query(query): Query<VerifyQuery>,
) -> impl IntoResponse {
    let mode = query.mode.as_deref().map(str::trim).unwrap_or_default();
    let token = query
        .verify_token
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();
    let token_ok = !adapter.verify_token.is_empty() && token == adapter.verify_token;
    if mode.eq_ignore_ascii_case("subscribe") && token_ok {
        return (StatusCode::OK, query.challenge.unwrap_or_default()).into_response();
    }
    tracing::warn!(mode, "whatsapp webhook verification rejected");
    (StatusCode::FORBIDDEN, "verification failed".to_string()).into_response()
}

#[tracing::instrument(level = "info", skip_all)]
async fn webhook_ingest(
    State(adapter): State<Arc<WhatsAppCloudAdapter>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = adapter.app_secret.as_deref() {
        if !verify_signature(&headers, &body, secret) {
            return error_response(StatusCode::UNAUTHORIZED, "invalid x-hub-signature-256");
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("invalid whatsapp webhook payload: {error}"),
            );
        }
    };

    let Some(tx) = adapter.inbound_tx.read().await.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "whatsapp adapter not started",
        );
    };

    let mut accepted = 0_usize;
    for message in payload.messages() {
        let Some(inbound) = convert_message(message) else {
            continue;
        };
        if let Err(error) = tx.send(inbound).await {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &format!("whatsapp inbound queue closed: {error}"),
            );
        }
        accepted += 1;
    }
    tracing::debug!(accepted, "whatsapp webhook ingested");

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "accepted": accepted })),
    )
        .into_response()
}

fn error_response(status: StatusCode, error: &str) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({ "status": "error", "error": error })),
    )
        .into_response()
}

/// Text messages only; reactions, media and status callbacks are ignored.
fn convert_message(message: &WebhookMessage) -> Option<InboundMessage> {
    let sender = message.from.trim();
    if sender.is_empty() || message.message_type != "text" {
        return None;
    }
    let content = message
        .text
        .as_ref()
        .map(|text| text.body.trim())
        .filter(|body| !body.is_empty())?
        .to_string();
    let message_id = if message.id.trim().is_empty() {
        ulid::Ulid::new().to_string()
    } else {
        message.id.trim().to_string()
    };

    Some(InboundMessage {
        message_id: message_id.into(),
        channel_id: "whatsapp".into(),
        sender_id: sender.into(),
        content,
        metadata: serde_json::json!({
            "provider": "whatsapp_cloud",
            "timestamp": message.timestamp,
        }),
        received_at: Utc::now(),
    })
}

fn verify_signature(headers: &HeaderMap, body: &[u8], app_secret: &str) -> bool {
    let Some(header) = headers
        .get("x-hub-signature-256")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
    else {
        return false;
    };
    let expected = format!("sha256={}", hmac_sha256_hex(app_secret.as_bytes(), body));
    constant_time_eq(expected.as_bytes(), header.as_bytes())
}

const HMAC_BLOCK: usize = 64;

fn hmac_sha256_hex(key: &[u8], payload: &[u8]) -> String {
    let mut block = [0_u8; HMAC_BLOCK];
    if key.len() > HMAC_BLOCK {
        block[..32].copy_from_slice(&Sha256::digest(key));
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let inner_pad: Vec<u8> = block.iter().map(|b| b ^ 0x36).collect();
    let outer_pad: Vec<u8> = block.iter().map(|b| b ^ 0x5c).collect();

    let inner = Sha256::new()
        .chain_update(&inner_pad)
        .chain_update(payload)
        .finalize();
    let outer = Sha256::new()
        .chain_update(&outer_pad)
        .chain_update(inner)
        .finalize();

    outer.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let max_len = left.len().max(right.len());
    let mut diff = left.len() ^ right.len();
    for index in 0..max_len {
        let l = left.get(index).copied().unwrap_or(0);
        let r = right.get(index).copied().unwrap_or(0);
        diff |= usize::from(l ^ r);
    }
    diff == 0
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

impl WebhookPayload {
    fn messages(&self) -> impl Iterator<Item = &WebhookMessage> {
        self.entry
            .iter()
            .flat_map(|entry| entry.changes.iter())
            .flat_map(|change| change.value.messages.iter())
    }
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    #[serde(default)]
    value: WebhookChangeValue,
}

#[derive(Debug, Default, Deserialize)]
struct WebhookChangeValue {
    #[serde(default)]
    messages: Vec<WebhookMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WebhookMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    text: Option<WebhookText>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WebhookText {
    #[serde(default)]
    body: String,
}
