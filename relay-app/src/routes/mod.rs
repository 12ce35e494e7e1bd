pub mod health;
pub mod messages;
pub mod queues;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(queues::router())
        .merge(messages::router())
}
