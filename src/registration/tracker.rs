use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Maps a farmer to the session their registration is running in, so a farmer who
/// writes again without a session id resumes where they left off.
#[derive(Debug, Default)]
pub struct RegistrationTracker {
    sessions: DashMap<i64, (String, Instant)>,
}

impl RegistrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_for(&self, farmer_id: i64) -> Option<String> {
        self.sessions.get(&farmer_id).map(|entry| entry.value().0.clone())
    }

    pub fn remember(&self, farmer_id: i64, session_id: impl Into<String>) {
        let session_id = session_id.into();
        debug!(farmer_id, session_id = %session_id, "Tracking registration session");
        self.sessions.insert(farmer_id, (session_id, Instant::now()));
    }

    /// Stop tracking a farmer, returning the session they were in.
    pub fn forget(&self, farmer_id: i64) -> Option<String> {
        self.sessions
            .remove(&farmer_id)
            .map(|(_, (session, _))| session)
    }

    /// Forget registrations untouched for `max_idle`; their sessions have expired.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, (_, touched)| touched.elapsed() < max_idle);
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remember_and_forget() {
        let tracker = RegistrationTracker::new();
        assert!(tracker.is_empty());

        tracker.remember(7, "session-a");
        assert_eq!(tracker.session_for(7).as_deref(), Some("session-a"));
        assert_eq!(tracker.len(), 1);

        tracker.remember(7, "session-b");
        assert_eq!(tracker.session_for(7).as_deref(), Some("session-b"));
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.forget(7).as_deref(), Some("session-b"));
        assert!(tracker.session_for(7).is_none());
        assert!(tracker.forget(7).is_none());
    }

    #[test]
    fn test_prune_idle_drops_abandoned_registrations() {
        let tracker = RegistrationTracker::new();
        tracker.remember(1, "abandoned");
        std::thread::sleep(Duration::from_millis(30));
        tracker.remember(2, "active");

        assert_eq!(tracker.prune_idle(Duration::from_millis(20)), 1);
        assert!(tracker.session_for(1).is_none());
        assert_eq!(tracker.session_for(2).as_deref(), Some("active"));
    }
}
