use crate::server::RelayState;
use axum::routing::get;
use axum::{Extension, Json};
use chrono::Utc;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new().route("/api/v1/relay/health", get(get_health))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    let mut channels: Vec<&str> = state.channels.keys().map(String::as_str).collect();
    channels.sort_unstable();

    Json(serde_json::json!({
        "status": "ok",
        "checked_at": Utc::now(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "channels": channels,
        "active_queues": state.dispatcher.registry().active_users(),
        "conversations": state.conversations.conversation_count(),
        "failure_policy": state.dispatcher.policy(),
    }))
}
