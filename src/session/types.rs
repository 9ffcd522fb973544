use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registration::RegistrationState;

/// Channel a conversation runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Registration,
    FarmingChat,
    #[default]
    Web,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Registration => "registration",
            Channel::FarmingChat => "farming_chat",
            Channel::Web => "web",
        }
    }
}

/// Who wrote a session message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Farmer,
    Ava,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionRole::Farmer => "farmer",
            SessionRole::Ava => "ava",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: SessionRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Placeholder stored instead of a message that carried a password.
pub const REDACTED: &str = "[REDACTED]";

/// A conversation with one farmer, including partial registration answers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub session_id: String,
    pub farmer_id: i64,
    pub channel: Channel,
    pub messages: Vec<SessionMessage>,
    #[serde(default)]
    pub registration: RegistrationState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(session_id: impl Into<String>, farmer_id: i64, channel: Channel) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            farmer_id,
            channel,
            messages: Vec::new(),
            registration: RegistrationState::default(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Append a message, keeping only the last `limit` messages.
    pub fn push(&mut self, role: SessionRole, content: impl Into<String>, limit: usize) {
        let now = Utc::now();
        self.messages.push(SessionMessage {
            role,
            content: content.into(),
            timestamp: now,
        });
        if self.messages.len() > limit {
            let overflow = self.messages.len() - limit;
            self.messages.drain(..overflow);
        }
        self.updated_at = now;
    }

    /// Replace the content of the most recent farmer message.
    pub fn redact_last_farmer_message(&mut self) {
        if let Some(message) = self
            .messages
            .iter_mut()
            .rev()
            .find(|m| m.role == SessionRole::Farmer)
        {
            message.content = REDACTED.to_string();
        }
    }

    /// The last `count` messages as `role: content` lines, oldest first.
    pub fn recent_context(&self, count: usize) -> String {
        let start = self.messages.len().saturating_sub(count);
        self.messages[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn last_farmer_message(&self) -> Option<&SessionMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == SessionRole::Farmer)
    }
}
