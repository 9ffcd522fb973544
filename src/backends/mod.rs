//! Network backends besides the relational store: the Neo4j knowledge graph and the
//! Pinecone vector index. Both are disabled in dry-run mode or when unconfigured,
//! in which case every call is a no-op returning an empty result.

mod graph;
mod vector;

use serde::{Deserialize, Serialize};

pub use graph::GraphStore;
pub use vector::{SimilarConversation, VectorStore};

/// Health of one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Healthy,
    Unhealthy,
    /// Not configured or dry-run. Never counts as degraded.
    Disabled,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Healthy => "healthy",
            BackendStatus::Unhealthy => "unhealthy",
            BackendStatus::Disabled => "disabled",
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, BackendStatus::Unhealthy)
    }
}

impl std::fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
