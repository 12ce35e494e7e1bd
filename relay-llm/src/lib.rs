//! Assistants API client for relaybot.
//!
//! Pure HTTP client: threads, messages and runs, polled to completion.

mod client;
mod error;
mod types;

pub use client::{AssistantsClient, DEFAULT_API_BASE_URL};
pub use error::{LlmError, Result};
pub use types::{RunStatus, ThreadState};
