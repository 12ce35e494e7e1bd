//! Drain loop: one spawned task per active user, owning that user's queue
//! until it observes it empty.

use crate::dead_letter::{DeadLetter, DeadLetterLog};
use crate::registry::UserQueueRegistry;
use crate::user::UserId;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What the drain loop does with an item whose processing failed. The loop
/// itself always moves on to the next item; failed items are never put back
/// in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Drop,
    RetryOnce,
    DeadLetter,
}

#[async_trait]
pub trait ItemProcessor<T>: Send + Sync {
    async fn process(&self, user: &UserId, item: &T) -> Result<()>;
}

pub struct DrainDispatcher<T> {
    registry: Arc<UserQueueRegistry<T>>,
    processor: Arc<dyn ItemProcessor<T>>,
    policy: FailurePolicy,
    dead_letters: Arc<DeadLetterLog<T>>,
}

impl<T> DrainDispatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(
        processor: Arc<dyn ItemProcessor<T>>,
        policy: FailurePolicy,
        dead_letters: Arc<DeadLetterLog<T>>,
    ) -> Self {
        Self {
            registry: Arc::new(UserQueueRegistry::new()),
            processor,
            policy,
            dead_letters,
        }
    }

    pub fn registry(&self) -> &Arc<UserQueueRegistry<T>> {
        &self.registry
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterLog<T>> {
        &self.dead_letters
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Queues `item` for `user` without waiting on any processing.
    ///
    /// Spawns a drain loop and returns its handle when no loop owns the user
    /// yet; otherwise the running loop picks the item up and `None` is
    /// returned.
    #[tracing::instrument(level = "debug", skip_all, fields(user_id = %user))]
    pub fn submit(self: &Arc<Self>, user: UserId, item: T) -> Option<JoinHandle<()>> {
        if !self.registry.enqueue(&user, item) {
            tracing::debug!(
                pending = self.registry.pending_len(&user),
                "appended to active queue"
            );
            return None;
        }

        let dispatcher = Arc::clone(self);
        Some(tokio::spawn(async move { dispatcher.drain(user).await }))
    }

    /// Waits up to `grace` for every drain loop to run out of work. Returns
    /// `false` if some user still had items when the time ran out.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let drained = async {
            while !self.registry.is_empty() {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(grace, drained).await.is_ok()
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %user))]
    async fn drain(&self, user: UserId) {
        let mut processed = 0_u64;
        while let Some(item) = self.registry.take_next(&user) {
            self.run_item(&user, item).await;
            self.registry.set_locked(&user, false);
            processed += 1;
        }
        tracing::info!(processed, "drain loop finished; user slot released");
    }

    async fn run_item(&self, user: &UserId, item: T) {
        let Err(error) = self.attempt(user, &item).await else {
            return;
        };

        match self.policy {
            FailurePolicy::Drop => {
                tracing::warn!(user_id = %user, %error, "message processing failed; dropped");
            }
            FailurePolicy::RetryOnce => {
                tracing::warn!(user_id = %user, %error, "message processing failed; retrying once");
                if let Err(error) = self.attempt(user, &item).await {
                    tracing::warn!(
                        user_id = %user,
                        %error,
                        "message processing failed after retry; dropped"
                    );
                }
            }
            FailurePolicy::DeadLetter => {
                tracing::warn!(
                    user_id = %user,
                    %error,
                    "message processing failed; moved to dead letters"
                );
                self.dead_letters
                    .record(DeadLetter {
                        user_id: user.clone(),
                        item,
                        error: error.to_string(),
                        failed_at: Utc::now(),
                    })
                    .await;
            }
        }
    }

    async fn attempt(&self, user: &UserId, item: &T) -> Result<()> {
        match AssertUnwindSafe(self.processor.process(user, item))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(payload) => Err(anyhow!(
                "message processing panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return msg.to_string();
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    "non-string panic payload".to_string()
}
