use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::types::ConversationSession;
use crate::backends::BackendStatus;
use crate::error::{BackendError, BackendResult};

/// Persistence for conversation sessions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session; `None` when unknown or expired.
    async fn load(&self, session_id: &str) -> BackendResult<Option<ConversationSession>>;

    /// Save a session, refreshing its expiry.
    async fn save(&self, session: &ConversationSession) -> BackendResult<()>;

    async fn delete(&self, session_id: &str) -> BackendResult<()>;

    async fn health_check(&self) -> BackendStatus;

    /// Whether sessions survive a process restart.
    fn is_durable(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Process-local session store with expiry. Sessions are lost on restart.
///
/// Expired sessions are swept on save at most once per TTL, so abandoned
/// sessions do not accumulate.
pub struct InMemorySessionStore {
    sessions: DashMap<String, (ConversationSession, Instant)>,
    ttl: Duration,
    last_sweep: Mutex<Instant>,
}

impl InMemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Drop every expired session, returning how many were removed.
    pub fn prune_expired(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, (_, saved_at)| saved_at.elapsed() < self.ttl);
        before.saturating_sub(self.sessions.len())
    }

    fn sweep_if_due(&self) {
        let due = {
            let mut last = self
                .last_sweep
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if last.elapsed() >= self.ttl {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if due {
            let pruned = self.prune_expired();
            if pruned > 0 {
                debug!(pruned, "Swept expired sessions");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, session_id: &str) -> BackendResult<Option<ConversationSession>> {
        let expired = match self.sessions.get(session_id) {
            Some(entry) => {
                let (session, saved_at) = entry.value();
                if saved_at.elapsed() < self.ttl {
                    return Ok(Some(session.clone()));
                }
                true
            }
            None => false,
        };

        if expired {
            debug!(session_id = %session_id, "Session expired");
            self.sessions.remove(session_id);
        }
        Ok(None)
    }

    async fn save(&self, session: &ConversationSession) -> BackendResult<()> {
        self.sweep_if_due();
        self.sessions.insert(
            session.session_id.clone(),
            (session.clone(), Instant::now()),
        );
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> BackendResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn health_check(&self) -> BackendStatus {
        BackendStatus::Healthy
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Redis-backed session store; sessions are JSON values under `cava:session:<id>`
/// with an `EX` expiry.
pub struct RedisSessionStore {
    connection: ConnectionManager,
    expire_secs: u64,
}

impl RedisSessionStore {
    pub async fn connect(url: &str, expire_secs: u64) -> BackendResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(expire_secs, "Connected to Redis session store");
        Ok(Self {
            connection,
            expire_secs,
        })
    }

    fn key(session_id: &str) -> String {
        format!("cava:session:{}", session_id)
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn load(&self, session_id: &str) -> BackendResult<Option<ConversationSession>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::key(session_id))
            .query_async(&mut conn)
            .await?;

        raw.map(|json| serde_json::from_str(&json).map_err(BackendError::from))
            .transpose()
    }

    async fn save(&self, session: &ConversationSession) -> BackendResult<()> {
        let mut conn = self.connection.clone();
        let json = serde_json::to_string(session)?;
        redis::cmd("SET")
            .arg(Self::key(&session.session_id))
            .arg(json)
            .arg("EX")
            .arg(self.expire_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> BackendResult<()> {
        let mut conn = self.connection.clone();
        redis::cmd("DEL")
            .arg(Self::key(session_id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> BackendStatus {
        let mut conn = self.connection.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => BackendStatus::Healthy,
            Err(_) => BackendStatus::Unhealthy,
        }
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Channel;

    #[tokio::test]
    async fn test_in_memory_round_trip() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        let session = ConversationSession::new("abc", 5, Channel::Web);

        store.save(&session).await.unwrap();
        assert_eq!(store.load("abc").await.unwrap(), Some(session));
        assert!(store.load("missing").await.unwrap().is_none());

        store.delete("abc").await.unwrap();
        assert!(store.load("abc").await.unwrap().is_none());
        assert!(!store.is_durable());
    }

    #[tokio::test]
    async fn test_in_memory_expiry() {
        let store = InMemorySessionStore::new(Duration::from_millis(20));
        store
            .save(&ConversationSession::new("abc", 5, Channel::Web))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.load("abc").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_sessions_are_swept_on_save() {
        let store = InMemorySessionStore::new(Duration::from_millis(20));
        store
            .save(&ConversationSession::new("abandoned", 5, Channel::Web))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        store
            .save(&ConversationSession::new("fresh", 6, Channel::Web))
            .await
            .unwrap();

        assert_eq!(store.len(), 1);
        assert!(store.load("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_prune_expired_keeps_live_sessions() {
        let store = InMemorySessionStore::new(Duration::from_secs(60));
        store
            .save(&ConversationSession::new("live", 5, Channel::Web))
            .await
            .unwrap();
        assert_eq!(store.prune_expired(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_redis_key_format() {
        assert_eq!(RedisSessionStore::key("abc"), "cava:session:abc");
    }
}
