//! # AVA OLO
//!
//! Agricultural assistant backend: the CAVA conversation engine that drives
//! farmer registration and farming Q&A over an LLM, plus the farm dashboard API.
//!
//! ## Features
//!
//! - **Conversation engine**: per-session turn handling with serialized writes
//! - **Registration flow**: typed registration state that never re-asks known answers
//! - **LLM query generator**: intent analysis, SQL generation and answers from records,
//!   with a deterministic degraded mode when no LLM is configured
//! - **Resilience**: per-service circuit breakers, fallbacks and one retry policy
//! - **Backends**: SQLite (sqlx), Redis or in-memory sessions, Neo4j and Pinecone over HTTP
//! - **Dashboard**: fields, crops, tasks and chat history routes
//!
//! ## Architecture
//!
//! ```text
//! HTTP (axum) → ConversationEngine → QueryGenerator → LLM (HTTP)
//!                      ↓                    ↓
//!              SessionStore (Redis)   FailoverManager
//!                      ↓
//!              SQLite / Neo4j / Pinecone
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use ava_olo::{server, AvaService, Config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let addr = config.server.bind_addr;
//!     let service = Arc::new(AvaService::init(config).await?);
//!     server::serve(Arc::clone(&service), addr).await?;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

/// Network backends: Neo4j graph and Pinecone vector index.
pub mod backends;
/// Configuration loaded from environment variables.
pub mod config;
/// Conversation engine and its request/response types.
pub mod conversation;
/// Error types and result aliases for the application.
pub mod error;
/// Message analysis and query generation.
pub mod generator;
/// OpenAI-compatible chat and embeddings client.
pub mod llm;
/// Response cache and parallel helpers.
pub mod performance;
/// System prompts for the LLM.
pub mod prompts;
/// Registration state and the farmer to session tracker.
pub mod registration;
/// Circuit breakers, fallbacks and retry policy.
pub mod resilience;
/// HTTP routes.
pub mod server;
/// Service construction and lifecycle.
pub mod service;
/// Conversation sessions and session stores.
pub mod session;
/// SQLite storage layer for persistence.
pub mod storage;

pub use config::Config;
pub use conversation::{ConversationEngine, ConversationRequest, ConversationResponse};
pub use error::{AppError, AppResult};
pub use server::SharedState;
pub use service::AvaService;
