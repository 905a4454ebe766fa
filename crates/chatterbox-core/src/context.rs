//! Context Builder: turns a chat's persisted history into a bounded prompt.
//!
//! The window keeps only the most recent [`DEFAULT_CONTEXT_LIMIT`] messages.
//! Older history is dropped silently; that is a latency/cost bound, not an
//! error.

use crate::entities::{ChatStore, Message};
use crate::error::{StoreError, TurnError};
use crate::turn::TurnPhase;

/// Number of persisted messages included in a prompt.
pub const DEFAULT_CONTEXT_LIMIT: u32 = 20;

/// Fetches history windows and renders prompts.
#[derive(Debug, Clone, Copy)]
pub struct ContextBuilder {
    limit: u32,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT_LIMIT)
    }
}

impl ContextBuilder {
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Look the chat up for `owner_id`, load its window and render the
    /// prompt for `content`.
    ///
    /// A chat owned by someone else is reported exactly like a missing one.
    pub async fn build<S: ChatStore>(
        &self,
        store: &S,
        chat_id: &str,
        owner_id: &str,
        content: &str,
    ) -> Result<String, TurnError> {
        store
            .find_chat_for_owner(chat_id, owner_id)
            .await
            .map_err(|e| TurnError::persistence(TurnPhase::Accepted, e))?
            .ok_or(TurnError::NotFound)?;
        let history = self
            .history(store, chat_id)
            .await
            .map_err(|e| TurnError::persistence(TurnPhase::Accepted, e))?;
        Ok(self.render(&history, content))
    }

    /// Load the window for `chat_id`, oldest first, without an ownership
    /// check.
    pub async fn history<S: ChatStore>(
        &self,
        store: &S,
        chat_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        store.list_recent_messages(chat_id, self.limit).await
    }

    /// Render `history` plus the new user content into one prompt string.
    ///
    /// History is clamped to the window size even if the caller handed over
    /// more than that.
    pub fn render(&self, history: &[Message], content: &str) -> String {
        let skip = history.len().saturating_sub(self.limit as usize);
        let window = &history[skip..];
        if window.is_empty() {
            return content.to_owned();
        }

        let mut lines: Vec<String> = window
            .iter()
            .map(|m| format!("{}: {}", m.role.label(), m.content))
            .collect();
        lines.push(format!("User: {content}"));
        lines.join("\n")
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
