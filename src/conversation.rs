//! # Conversations and messages
//!
//! A [Conversation] is created on the first message of a session and mutated
//! by every exchange: each appended [Message] bumps the aggregate token and
//! message counters and refreshes the last-activity timestamp. Archiving and
//! deletion are explicit transitions; nothing happens silently.
//!
//! Messages are immutable once stored; there is no API to edit one after it
//! has been pushed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::intent::IntentResult;
use crate::quality::QualityScore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// One stored exchange turn. Construct with [Message::new] and the builder
/// methods; immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Model identifier used for this message; empty for user messages.
    pub model: String,
    pub tokens: u32,
    pub latency: Duration,
    pub cached: bool,
    pub intent: Option<IntentResult>,
    pub quality: Option<QualityScore>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            model: String::new(),
            tokens: 0,
            latency: Duration::ZERO,
            cached: false,
            intent: None,
            quality: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_cached(mut self, cached: bool) -> Self {
        self.cached = cached;
        self
    }

    pub fn with_intent(mut self, intent: IntentResult) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn with_quality(mut self, quality: QualityScore) -> Self {
        self.quality = Some(quality);
        self
    }
}

/// A session-scoped message sequence with running aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub session_key: String,
    pub user_id: String,
    pub status: ConversationStatus,
    messages: Vec<Message>,
    pub total_tokens: u64,
    pub message_count: u64,
    pub last_activity: DateTime<Utc>,
}

impl Conversation {
    pub fn new(session_key: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_key: session_key.into(),
            user_id: user_id.into(),
            status: ConversationStatus::Active,
            messages: Vec::new(),
            total_tokens: 0,
            message_count: 0,
            last_activity: Utc::now(),
        }
    }

    /// Append a message, updating the aggregates. Fails if the conversation
    /// is archived or deleted.
    pub fn push(&mut self, message: Message) -> Result<(), errors::ConversationClosed> {
        if self.status != ConversationStatus::Active {
            return Err(errors::ConversationClosed {
                session_key: self.session_key.clone(),
                status: self.status,
            });
        }
        self.total_tokens += u64::from(message.tokens);
        self.message_count += 1;
        self.last_activity = Utc::now();
        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent classified intent in this conversation, used as prior
    /// context by the classifier.
    pub fn last_intent(&self) -> Option<&IntentResult> {
        self.messages.iter().rev().find_map(|m| m.intent.as_ref())
    }

    /// The trailing `window` messages, oldest first.
    pub fn history_window(&self, window: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(window);
        &self.messages[start..]
    }

    pub fn archive(&mut self) {
        self.status = ConversationStatus::Archived;
    }

    pub fn mark_deleted(&mut self) {
        self.status = ConversationStatus::Deleted;
    }
}

pub mod errors {
    use std::error::Error;
    use std::fmt;
    use std::fmt::Formatter;

    use super::ConversationStatus;

    /// Error when appending to a conversation that is no longer active.
    #[derive(Debug)]
    pub struct ConversationClosed {
        pub session_key: String,
        pub status: ConversationStatus,
    }

    impl fmt::Display for ConversationClosed {
        fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "ConversationClosed: session {} is {:?} and cannot accept messages",
                self.session_key, self.status
            )
        }
    }

    impl Error for ConversationClosed {}
}

#[cfg(test)]
mod conversation_tests {
    use super::*;

    #[test]
    fn test_push_updates_aggregates() {
        let mut convo = Conversation::new("sess-1", "user-1");
        convo
            .push(Message::new(MessageRole::User, "list my instances"))
            .unwrap();
        convo
            .push(
                Message::new(MessageRole::Assistant, "You have 3 instances.")
                    .with_model("ops-llm-1")
                    .with_tokens(120),
            )
            .unwrap();
        assert_eq!(2, convo.message_count);
        assert_eq!(120, convo.total_tokens);
    }

    #[test]
    fn test_push_to_archived_fails() {
        let mut convo = Conversation::new("sess-2", "user-1");
        convo.archive();
        let err = convo
            .push(Message::new(MessageRole::User, "hello?"))
            .unwrap_err();
        assert_eq!(ConversationStatus::Archived, err.status);
    }

    #[test]
    fn test_history_window_returns_trailing_messages() {
        let mut convo = Conversation::new("sess-3", "user-1");
        for i in 0..5 {
            convo
                .push(Message::new(MessageRole::User, format!("msg {}", i)))
                .unwrap();
        }
        let window = convo.history_window(2);
        assert_eq!(2, window.len());
        assert_eq!("msg 3", window[0].content);
        assert_eq!("msg 4", window[1].content);
    }
}
