//! In-memory per-user queue registry.
//!
//! One `DashMap` entry per user bundles the pending queue with the busy flag,
//! so every check-and-mutate step runs under that key's shard lock. An entry
//! exists exactly while some drain loop owns the user; idle users cost nothing.

use crate::user::UserId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug)]
struct UserSlot<T> {
    queue: VecDeque<T>,
    locked: bool,
}

impl<T> UserSlot<T> {
    fn with_first(item: T) -> Self {
        let mut queue = VecDeque::with_capacity(4);
        queue.push_back(item);
        Self {
            queue,
            locked: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub user_id: UserId,
    pub pending: usize,
    pub locked: bool,
}

pub struct UserQueueRegistry<T> {
    slots: DashMap<UserId, UserSlot<T>>,
}

impl<T> Default for UserQueueRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UserQueueRegistry<T> {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    /// Appends `item` to the user's queue.
    ///
    /// Returns `true` when this call created the user's entry: no drain loop
    /// owns the user and the caller must start one. Concurrent callers for
    /// the same user serialize on the entry, so at most one sees `true`.
    pub fn enqueue(&self, user: &UserId, item: T) -> bool {
        match self.slots.entry(user.clone()) {
            Entry::Occupied(mut slot) => {
                slot.get_mut().queue.push_back(item);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(UserSlot::with_first(item));
                true
            }
        }
    }

    pub fn is_locked(&self, user: &UserId) -> bool {
        self.slots.get(user).is_some_and(|slot| slot.locked)
    }

    /// Sets the busy flag. Absent users are left absent.
    pub fn set_locked(&self, user: &UserId, value: bool) {
        if let Some(mut slot) = self.slots.get_mut(user) {
            slot.locked = value;
        }
    }

    pub fn pop_front(&self, user: &UserId) -> Option<T> {
        self.slots
            .get_mut(user)
            .and_then(|mut slot| slot.queue.pop_front())
    }

    /// Drops the user's queue and lock entry unconditionally.
    pub fn clear(&self, user: &UserId) {
        self.slots.remove(user);
    }

    /// Drain-loop step: locks the user and pops the head item, or, when the
    /// queue is empty, removes the whole entry and returns `None`.
    ///
    /// Both branches run under one entry lock, so an enqueue racing with the
    /// final check either lands before it (and is returned here) or after it
    /// (and finds the user vacant, starting a fresh loop).
    pub fn take_next(&self, user: &UserId) -> Option<T> {
        let Entry::Occupied(mut slot) = self.slots.entry(user.clone()) else {
            return None;
        };
        match slot.get_mut().queue.pop_front() {
            Some(item) => {
                slot.get_mut().locked = true;
                Some(item)
            }
            None => {
                slot.remove();
                None
            }
        }
    }

    pub fn pending_len(&self, user: &UserId) -> usize {
        self.slots.get(user).map_or(0, |slot| slot.queue.len())
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.slots.contains_key(user)
    }

    pub fn active_users(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn snapshot(&self) -> Vec<QueueStatus> {
        let mut out: Vec<QueueStatus> = self
            .slots
            .iter()
            .map(|entry| QueueStatus {
                user_id: entry.key().clone(),
                pending: entry.value().queue.len(),
                locked: entry.value().locked,
            })
            .collect();
        out.sort_by(|a, b| a.user_id.as_str().cmp(b.user_id.as_str()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_enqueue_creates_entry_and_later_ones_append() {
        let registry = UserQueueRegistry::new();
        let user = UserId::from("whatsapp:15550001");

        assert!(registry.enqueue(&user, "m1"));
        assert!(!registry.enqueue(&user, "m2"));
        assert!(!registry.enqueue(&user, "m3"));
        assert_eq!(registry.pending_len(&user), 3);
        assert!(!registry.is_locked(&user));
    }

    #[test]
    fn enqueue_while_head_in_flight_is_not_first() {
        let registry = UserQueueRegistry::new();
        let user = UserId::from("u");

        assert!(registry.enqueue(&user, 1));
        assert_eq!(registry.take_next(&user), Some(1));
        assert!(registry.is_locked(&user));
        assert_eq!(registry.pending_len(&user), 0);

        // The queue is empty but a loop still owns the user.
        assert!(!registry.enqueue(&user, 2));
        registry.set_locked(&user, false);
        assert!(!registry.enqueue(&user, 3));
        assert_eq!(registry.take_next(&user), Some(2));
        assert_eq!(registry.take_next(&user), Some(3));
    }

    #[test]
    fn take_next_on_empty_queue_removes_entry() {
        let registry = UserQueueRegistry::new();
        let user = UserId::from("u");

        registry.enqueue(&user, "only");
        assert_eq!(registry.take_next(&user), Some("only"));
        registry.set_locked(&user, false);
        assert_eq!(registry.take_next(&user), None);
        assert!(!registry.contains(&user));
        assert!(registry.is_empty());

        // Idle again: the next message starts a fresh queue.
        assert!(registry.enqueue(&user, "again"));
    }

    #[test]
    fn set_locked_does_not_create_entries() {
        let registry: UserQueueRegistry<u8> = UserQueueRegistry::new();
        let user = UserId::from("ghost");
        registry.set_locked(&user, true);
        assert!(!registry.contains(&user));
        assert!(!registry.is_locked(&user));
    }

    #[test]
    fn pop_front_and_clear() {
        let registry = UserQueueRegistry::new();
        let a = UserId::from("a");
        let b = UserId::from("b");
        registry.enqueue(&a, 'x');
        registry.enqueue(&a, 'y');
        registry.enqueue(&b, 'z');

        assert_eq!(registry.pop_front(&a), Some('x'));
        assert_eq!(registry.pop_front(&a), Some('y'));
        assert_eq!(registry.pop_front(&a), None);
        assert!(registry.contains(&a));

        registry.clear(&a);
        assert!(!registry.contains(&a));
        assert_eq!(registry.active_users(), 1);
        assert_eq!(registry.pop_front(&a), None);
    }

    #[test]
    fn snapshot_reports_pending_and_lock_state() {
        let registry = UserQueueRegistry::new();
        let a = UserId::from("a");
        let b = UserId::from("b");
        registry.enqueue(&b, 1);
        registry.enqueue(&a, 1);
        registry.enqueue(&a, 2);
        registry.take_next(&a);

        let snapshot = registry.snapshot();
        assert_eq!(
            snapshot,
            vec![
                QueueStatus {
                    user_id: a,
                    pending: 1,
                    locked: true,
                },
                QueueStatus {
                    user_id: b,
                    pending: 1,
                    locked: false,
                },
            ]
        );
    }

    #[test]
    fn concurrent_enqueues_elect_exactly_one_starter() {
        let registry = Arc::new(UserQueueRegistry::new());
        let user = UserId::from("racer");
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = registry.clone();
                let user = user.clone();
                std::thread::spawn(move || registry.enqueue(&user, i))
            })
            .collect();

        let starters = handles
            .into_iter()
            .map(|h| h.join().expect("enqueue thread"))
            .filter(|first| *first)
            .count();
        assert_eq!(starters, 1);
        assert_eq!(registry.pending_len(&user), 16);
    }
}
