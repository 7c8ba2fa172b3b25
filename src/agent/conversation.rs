//! Per-session conversation history.
//!
//! The history is an ordered list of `(role, text)` turns owned by the
//! session; providers (including a fallback taking over mid-session) are
//! consumers and never mutate prior turns.

use serde::{Deserialize, Serialize};

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of the LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

/// The growing conversation for one memory session.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::User,
            text: text.into(),
        });
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(Turn {
            role: Role::Assistant,
            text: text.into(),
        });
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The most recent user turn — what a single-prompt provider replays.
    pub fn last_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.text.as_str())
    }

    /// Drop the trailing user turn. Used when a provider call fails before
    /// producing an assistant reply and the message will be replayed through
    /// the fallback with the same text.
    pub fn pop_unanswered_user(&mut self) -> Option<Turn> {
        match self.turns.last() {
            Some(t) if t.role == Role::User => self.turns.pop(),
            _ => None,
        }
    }
}
