use crate::server::RelayState;
use axum::routing::post;
use axum::{Extension, Json};
use relay_channels::OutboundMessage;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct SendRequest {
    channel: String,
    recipient: String,
    message: String,
}

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/relay/messages/send", post(send_message))
}

/// Operator send; goes straight to the channel, outside any user's queue.
#[tracing::instrument(level = "info", skip_all)]
async fn send_message(
    Extension(state): Extension<Arc<RelayState>>,
    Json(req): Json<SendRequest>,
) -> Json<serde_json::Value> {
    let Some(adapter) = state.channels.get(&req.channel) else {
        return Json(serde_json::json!({ "status": "error", "error": "unknown channel" }));
    };
    if req.message.trim().is_empty() {
        return Json(serde_json::json!({ "status": "error", "error": "message is empty" }));
    }

    if let Err(e) = adapter
        .send(&req.recipient, OutboundMessage::text(req.message))
        .await
    {
        tracing::warn!(%e, channel = %req.channel, "operator send failed");
        return Json(serde_json::json!({ "status": "error", "error": e.to_string() }));
    }

    Json(serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use crate::testing::{relay_state_with_channel, response_body_json};
    use axum::Extension;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn post(
        state: std::sync::Arc<crate::server::RelayState>,
        body: &str,
    ) -> serde_json::Value {
        let response = super::router()
            .layer(Extension(state))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/relay/messages/send")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        response_body_json(response).await
    }

    #[tokio::test]
    async fn sends_through_named_channel() {
        let (state, channel) = relay_state_with_channel();
        let body = post(
            state,
            r#"{"channel":"fake","recipient":"alice","message":"maintenance at 5pm"}"#,
        )
        .await;

        assert_eq!(body["status"], "ok");
        assert_eq!(
            channel.sent_bodies().await,
            vec!["maintenance at 5pm".to_string()]
        );
    }

    #[tokio::test]
    async fn unknown_channel_is_reported() {
        let (state, channel) = relay_state_with_channel();
        let body = post(
            state,
            r#"{"channel":"telegram","recipient":"alice","message":"hi"}"#,
        )
        .await;

        assert_eq!(body["status"], "error");
        assert_eq!(channel.send_attempts(), 0);
    }
}
