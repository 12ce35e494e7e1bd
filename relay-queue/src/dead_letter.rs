use crate::user::UserId;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct DeadLetter<T> {
    pub user_id: UserId,
    pub item: T,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Bounded log of items whose processing failed. Oldest entries are evicted
/// once `capacity` is reached.
pub struct DeadLetterLog<T> {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter<T>>>,
}

impl<T: Clone> DeadLetterLog<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn record(&self, letter: DeadLetter<T>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock().await;
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(letter);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<DeadLetter<T>> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(item: u32) -> DeadLetter<u32> {
        DeadLetter {
            user_id: UserId::from("u"),
            item,
            error: format!("boom {item}"),
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn evicts_oldest_beyond_capacity() {
        let log = DeadLetterLog::new(2);
        log.record(letter(1)).await;
        log.record(letter(2)).await;
        log.record(letter(3)).await;

        let items: Vec<u32> = log.snapshot().await.into_iter().map(|l| l.item).collect();
        assert_eq!(items, vec![2, 3]);
        assert_eq!(log.len().await, 2);
    }

    #[tokio::test]
    async fn zero_capacity_records_nothing() {
        let log = DeadLetterLog::new(0);
        log.record(letter(1)).await;
        assert_eq!(log.len().await, 0);
    }
}
