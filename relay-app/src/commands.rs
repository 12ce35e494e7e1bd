//! Keyword commands answered directly, without the queue or the assistant.

use crate::config::CommandsConfig;

const MAX_LISTED_TITLES: usize = 10;

pub const EMPTY_QUERY_REPLY: &str = "📚 Please enter the title of the book you are looking for.";
pub const NO_MATCH_REPLY: &str = "❌ I couldn't find any books with that name. Try another term.";

#[derive(Debug, Clone)]
pub struct CommandRouter {
    search_keyword: String,
    catalog: Vec<String>,
}

impl CommandRouter {
    pub fn from_config(cfg: &CommandsConfig) -> Self {
        Self {
            search_keyword: cfg.search_keyword.trim().to_lowercase(),
            catalog: cfg
                .catalog
                .iter()
                .map(|title| title.trim().to_string())
                .filter(|title| !title.is_empty())
                .collect(),
        }
    }

    /// Returns the reply when `input` is a command, `None` when it should go
    /// to the assistant.
    pub fn handle(&self, input: &str) -> Option<String> {
        let trimmed = input.trim();
        let (first, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        if first.to_lowercase() != self.search_keyword {
            return None;
        }
        Some(self.search(rest.trim()))
    }

    fn search(&self, query: &str) -> String {
        if query.is_empty() {
            return EMPTY_QUERY_REPLY.to_string();
        }

        let needle = query.to_lowercase();
        let matches: Vec<&str> = self
            .catalog
            .iter()
            .filter(|title| title.to_lowercase().contains(&needle))
            .map(String::as_str)
            .collect();
        tracing::debug!(query = %query, matches = matches.len(), "search command");

        if matches.is_empty() {
            return NO_MATCH_REPLY.to_string();
        }

        let mut reply = String::from("📚 Books found:");
        for title in matches.iter().take(MAX_LISTED_TITLES) {
            reply.push_str("\n- ");
            reply.push_str(title);
        }
        if matches.len() > MAX_LISTED_TITLES {
            reply.push_str(&format!(
                "\n…and {} more. Try a more specific title.",
                matches.len() - MAX_LISTED_TITLES
            ));
        }
        reply
    }
}
