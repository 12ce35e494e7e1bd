//! In-memory conversation state per user: the backend thread plus a little
//! bookkeeping. Nothing here survives a restart.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use relay_llm::ThreadState;
use relay_queue::UserId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct Conversation {
    pub thread: ThreadState,
    pub exchanges: u64,
    pub created_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            thread: ThreadState::default(),
            exchanges: 0,
            created_at: Utc::now(),
            last_active: None,
        }
    }
}

impl Conversation {
    pub fn record_exchange(&mut self) {
        self.exchanges += 1;
        self.last_active = Some(Utc::now());
    }

    pub fn idle_since(&self) -> DateTime<Utc> {
        self.last_active.unwrap_or(self.created_at)
    }
}

pub type ConversationHandle = Arc<Mutex<Conversation>>;

#[derive(Default)]
pub struct ConversationStore {
    conversations: DashMap<UserId, ConversationHandle>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, user: &UserId) -> ConversationHandle {
        self.conversations
            .entry(user.clone())
            .or_default()
            .value()
            .clone()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Forgets conversations idle for longer than `max_idle`. Returns how many
    /// were removed.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|max_idle| Utc::now().checked_sub_signed(max_idle));
        match cutoff {
            Some(cutoff) => self.evict_idle_before(cutoff),
            None => 0,
        }
    }

    /// Removes conversations last active at or before `cutoff`. Handles still
    /// held by a queued or running item, or locked right now, are kept.
    pub fn evict_idle_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.conversations.retain(|_, handle| {
            let keep = Arc::strong_count(handle) > 1
                || match handle.try_lock() {
                    Ok(conversation) => conversation.idle_since() > cutoff,
                    Err(_) => true,
                };
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }
}

/// Periodically evicts idle conversations until `shutdown` fires.
pub fn spawn_idle_sweeper(
    store: Arc<ConversationStore>,
    max_idle: Duration,
    every: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = store.evict_idle(max_idle);
                    if evicted > 0 {
                        tracing::info!(
                            evicted,
                            remaining = store.conversation_count(),
                            "idle conversations evicted"
                        );
                    }
                }
            }
        }
    })
}
