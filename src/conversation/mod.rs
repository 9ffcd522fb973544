//! The conversation engine: one farmer message in, one AVA reply out.
//!
//! A turn loads the session, analyzes the message (through the response cache),
//! routes it to the registration or farming sub-flow or to small talk, saves the
//! session and writes the audit trail.

mod engine;
mod types;

pub use engine::{ConversationEngine, EngineParts};
pub use types::{ConversationRequest, ConversationResponse, EmotionalState, TROUBLE_MESSAGE};
