use crate::relay::PendingItem;
use crate::server::RelayState;
use axum::routing::get;
use axum::{Extension, Json};
use relay_queue::DeadLetter;
use std::sync::Arc;

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/api/v1/relay/queues", get(list_queues))
        .route("/api/v1/relay/dead_letters", get(list_dead_letters))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_queues(Extension(state): Extension<Arc<RelayState>>) -> Json<serde_json::Value> {
    let queues = state.dispatcher.registry().snapshot();
    Json(serde_json::json!({ "queues": queues }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn list_dead_letters(
    Extension(state): Extension<Arc<RelayState>>,
) -> Json<serde_json::Value> {
    let dead_letters = state.dispatcher.dead_letters();
    let entries: Vec<serde_json::Value> = dead_letters
        .snapshot()
        .await
        .iter()
        .map(dead_letter_json)
        .collect();
    Json(serde_json::json!({
        "failure_policy": state.dispatcher.policy(),
        "capacity": dead_letters.capacity(),
        "dead_letters": entries,
    }))
}

fn dead_letter_json(letter: &DeadLetter<PendingItem>) -> serde_json::Value {
    let inbound = &letter.item.inbound;
    serde_json::json!({
        "user_id": letter.user_id,
        "channel_id": inbound.channel_id,
        "message_id": inbound.message_id,
        "content": inbound.content,
        "received_at": inbound.received_at,
        "error": letter.error,
        "failed_at": letter.failed_at,
    })
}

#[cfg(test)]
mod tests {
    use crate::testing::{pending_item, relay_state, response_body_json};
    use axum::Extension;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use relay_queue::{DeadLetter, UserId};
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn queues_route_reports_pending_and_lock_state() {
        let state = relay_state();
        let registry = state.dispatcher.registry();
        let alice = UserId::from("fake:alice");
        registry.enqueue(&alice, pending_item("alice", "m1", "one"));
        registry.enqueue(&alice, pending_item("alice", "m2", "two"));
        registry.set_locked(&alice, true);

        let response = super::router()
            .layer(Extension(state.clone()))
            .oneshot(
                Request::builder()
                    .uri("/api/v1/relay/queues")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let body = response_body_json(response).await;
        assert_eq!(
            body["queues"],
            serde_json::json!([{ "user_id": "fake:alice", "pending": 2, "locked": true }])
        );
    }

    #[tokio::test]
    async fn dead_letters_route_lists_failed_messages() {
        let state = relay_state();
        state
            .dispatcher
            .dead_letters()
            .record(DeadLetter {
                user_id: UserId::from("fake:bob"),
                item: pending_item("bob", "m7", "hello?"),
                error: "run failed".to_string(),
                failed_at: Utc::now(),
            })
            .await;

        let response = super::router()
            .layer(Extension(state.clone()))
            .oneshot(
                Request::builder()
                    .uri("/api/v1/relay/dead_letters")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let body = response_body_json(response).await;

        let entries = body["dead_letters"].as_array().expect("array");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["user_id"], "fake:bob");
        assert_eq!(entries[0]["message_id"], "m7");
        assert_eq!(entries[0]["content"], "hello?");
        assert_eq!(entries[0]["error"], "run failed");
        assert!(entries[0].get("attempts").is_none());
    }
}
