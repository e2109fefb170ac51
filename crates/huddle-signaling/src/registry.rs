//! Maps meeting IDs to live [`Session`]s.
//!
//! Sessions are created lazily by the first connection for a meeting and
//! remove themselves when they end. The registry lock only guards creation
//! and removal; message routing never touches it. Lock order is always
//! session before registry, and the registry never locks a session while
//! holding its own lock.

use crate::session::Session;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub(crate) type SessionMap = RwLock<HashMap<String, Arc<Session>>>;

/// Process-wide set of live sessions.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the session for a meeting, creating it with `host_id` if absent.
    ///
    /// At most one session exists per meeting ID, even when several first
    /// connections race. The host of an existing session is never changed.
    pub async fn get_or_create(&self, meeting_id: &str, host_id: &str) -> Arc<Session> {
        if let Some(session) = self.sessions.read().await.get(meeting_id) {
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(meeting_id.to_owned())
            .or_insert_with(|| {
                tracing::info!(meeting = %meeting_id, host = %host_id, "Session created");
                Arc::new(Session::new(
                    meeting_id.to_owned(),
                    host_id.to_owned(),
                    Arc::downgrade(&self.sessions),
                ))
            })
            .clone()
    }

    /// Look up a live session.
    pub async fn get(&self, meeting_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(meeting_id).cloned()
    }

    /// Deregister `session` if it is still the one registered for its meeting.
    ///
    /// Returns `false` when the entry is missing or already belongs to a newer session.
    pub async fn remove(&self, session: &Arc<Session>) -> bool {
        remove_session(&self.sessions, session).await
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Get stats about live sessions.
    pub async fn stats(&self) -> RegistryStats {
        // Snapshot first so no session lock is taken under the registry lock.
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let mut stats = RegistryStats {
            active_sessions: sessions.len(),
            ..RegistryStats::default()
        };
        for session in sessions {
            let snapshot = session.snapshot().await;
            stats.active_participants += snapshot.active.len();
            stats.waiting_participants += snapshot.waiting.len();
        }
        stats
    }
}

pub(crate) async fn remove_session(sessions: &SessionMap, session: &Arc<Session>) -> bool {
    let mut sessions = sessions.write().await;
    let registered = sessions
        .get(session.meeting_id())
        .is_some_and(|current| Arc::ptr_eq(current, session));
    if registered {
        sessions.remove(session.meeting_id());
    }
    registered
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub active_sessions: usize,
    pub active_participants: usize,
    pub waiting_participants: usize,
}
