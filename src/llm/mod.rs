//! OpenAI-compatible chat completions and embeddings client.

mod client;
mod types;

pub use client::{is_retryable, LlmClient};
pub use types::{
    ChatRequest, ChatResponse, Choice, EmbeddingData, EmbeddingRequest, EmbeddingResponse,
    Message, MessageRole, ResponseFormat, Usage,
};
