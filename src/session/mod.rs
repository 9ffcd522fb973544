//! Conversation sessions: bounded message history, per-session locks and the
//! session store seam (in-memory or Redis).

mod locks;
mod store;
mod types;

pub use locks::SessionLocks;
#[cfg(test)]
pub use store::MockSessionStore;
pub use store::{InMemorySessionStore, RedisSessionStore, SessionStore};
pub use types::{Channel, ConversationSession, SessionMessage, SessionRole, REDACTED};
