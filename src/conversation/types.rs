use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::generator::{ConversationType, IntentAnalysis};
use crate::session::Channel;

/// One inbound farmer message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub farmer_id: i64,
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ConversationRequest {
    pub fn new(farmer_id: i64, message: impl Into<String>) -> Self {
        Self {
            farmer_id,
            message: message.into(),
            session_id: None,
            channel: None,
            metadata: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }
}

/// AVA's reply to one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub success: bool,
    pub session_id: String,
    pub message: String,
    pub conversation_type: ConversationType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<IntentAnalysis>,
    /// The farmer still owes an answer (e.g. the next registration field).
    pub requires_action: bool,
    /// Produced without the LLM or with a dependency unavailable.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reply sent when a turn fails unexpectedly.
pub const TROUBLE_MESSAGE: &str =
    "I'm having trouble processing your message right now. Please try again in a moment.";

impl ConversationResponse {
    pub fn failure(session_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: session_id.into(),
            message: TROUBLE_MESSAGE.to_string(),
            conversation_type: ConversationType::GeneralChat,
            analysis: None,
            requires_action: false,
            degraded: true,
            error: Some(error.into()),
        }
    }
}

/// Emotional tone of a message, folded into the farming context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmotionalState {
    Neutral,
    Worried,
    Frustrated,
    Positive,
}

impl EmotionalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmotionalState::Neutral => "neutral",
            EmotionalState::Worried => "worried",
            EmotionalState::Frustrated => "frustrated",
            EmotionalState::Positive => "positive",
        }
    }

    /// Keyword heuristic; worry outranks frustration, which outranks positivity.
    pub fn detect(message: &str) -> Self {
        const WORRIED: &[&str] = &[
            "worried", "afraid", "concern", "anxious", "scared", "losing", "dying", "died",
            "urgent", "help!",
        ];
        const FRUSTRATED: &[&str] = &[
            "frustrat", "angry", "annoyed", "useless", "terrible", "again!", "fed up",
        ];
        const POSITIVE: &[&str] = &[
            "great", "happy", "excellent", "amazing", "glad", "wonderful", "thank",
        ];

        let lower = message.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        if has(WORRIED) {
            EmotionalState::Worried
        } else if has(FRUSTRATED) {
            EmotionalState::Frustrated
        } else if has(POSITIVE) {
            EmotionalState::Positive
        } else {
            EmotionalState::Neutral
        }
    }
}
