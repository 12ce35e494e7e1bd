//! Per-user message serialization for relaybot.
//!
//! Messages from one user are processed one at a time, in arrival order, by a
//! single drain loop that owns that user's queue until it runs dry. Different
//! users drain concurrently.

mod dead_letter;
mod drain;
mod registry;
mod user;

pub use dead_letter::{DeadLetter, DeadLetterLog};
pub use drain::{DrainDispatcher, FailurePolicy, ItemProcessor};
pub use registry::{QueueStatus, UserQueueRegistry};
pub use user::UserId;
