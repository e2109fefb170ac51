//! The live state of one meeting and its admission state machine.
//!
//! ```text
//! connect ──┬── id == host ──────────────────────────────► active
//!           └── otherwise ──► waiting ── host accepts ──► active
//!                                │
//!                                └── rejected ──► removed (close 4000)
//! active | waiting ── leave / disconnect / evicted ──► removed
//! ```
//!
//! All state lives in one [`SessionState`] behind a single mutex. Every
//! transition, including the fan-out it causes, runs with that lock held, so
//! a participant is never in both maps and a broadcast never races a removal.
//! Deliveries are non-blocking enqueues, which keeps the critical sections
//! short no matter how slow a recipient is.

use crate::message::{MessageType, SignalMessage};
use crate::participant::{CLOSE_SUPERSEDED, Endpoint, Participant};
use crate::registry::{self, SessionMap};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Where a participant currently sits in its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Waiting,
    Active,
}

/// Identifies one participant's connection within a session.
///
/// The connection ID distinguishes a participant from an older or newer
/// connection that used the same identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRef {
    pub id: String,
    pub connection_id: Uuid,
}

/// Outcome of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub participant: ParticipantRef,
    pub admission: Admission,
}

/// The session already ended; the endpoint is handed back for a retry.
#[derive(Debug)]
pub struct SessionClosed(pub Endpoint);

/// Point-in-time view of a session's membership, sorted by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub active: Vec<String>,
    pub waiting: Vec<String>,
    pub closed: bool,
}

pub(crate) struct Removal {
    pub(crate) participant: Participant,
    pub(crate) teardown: bool,
}

pub(crate) struct SessionState {
    pub(crate) active: HashMap<String, Participant>,
    pub(crate) waiting: HashMap<String, Participant>,
    next_generated_id: u64,
    /// Set once the session has torn down; no one may join afterwards.
    pub(crate) closed: bool,
}

impl SessionState {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            waiting: HashMap::new(),
            next_generated_id: 1,
            closed: false,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.active.contains_key(id) || self.waiting.contains_key(id)
    }

    /// Find the participant behind `who`, if that exact connection is still present.
    pub(crate) fn find(&self, who: &ParticipantRef) -> Option<(&Participant, Admission)> {
        let found = match self.active.get(&who.id) {
            Some(p) => Some((p, Admission::Active)),
            None => self.waiting.get(&who.id).map(|p| (p, Admission::Waiting)),
        };
        found.filter(|(p, _)| p.connection_id == who.connection_id)
    }

    fn take(&mut self, who: &ParticipantRef) -> Option<(Participant, Admission)> {
        let admission = self.find(who)?.1;
        let participant = match admission {
            Admission::Active => self.active.remove(&who.id),
            Admission::Waiting => self.waiting.remove(&who.id),
        }?;
        Some((participant, admission))
    }

    /// Remove whichever connection currently holds `id`.
    fn take_identity(&mut self, id: &str) -> Option<(Participant, Admission)> {
        match self.active.remove(id) {
            Some(p) => Some((p, Admission::Active)),
            None => self.waiting.remove(id).map(|p| (p, Admission::Waiting)),
        }
    }

    fn generate_id(&mut self, meeting_id: &str, host_id: &str) -> String {
        loop {
            let candidate = format!("{meeting_id}-{}", self.next_generated_id);
            self.next_generated_id += 1;
            if candidate != host_id && !self.contains(&candidate) {
                return candidate;
            }
        }
    }
}

/// One meeting's live state.
pub struct Session {
    meeting_id: String,
    host_id: String,
    registry: Weak<SessionMap>,
    pub(crate) state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(meeting_id: String, host_id: String, registry: Weak<SessionMap>) -> Self {
        Self {
            meeting_id,
            host_id,
            registry,
            state: Mutex::new(SessionState::new()),
        }
    }

    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Admit a new connection.
    ///
    /// `identity` is the authenticated user ID, if any; unauthenticated
    /// connections get a generated `<meeting>-<n>` ID. The host goes straight
    /// to `active`; everyone else waits and the host is asked to decide.
    /// A connection reusing an identity already present replaces it.
    pub async fn join(
        self: &Arc<Self>,
        identity: Option<String>,
        endpoint: Endpoint,
    ) -> Result<Joined, SessionClosed> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(SessionClosed(endpoint));
        }

        let id = match identity {
            Some(id) if !id.is_empty() => id,
            _ => state.generate_id(&self.meeting_id, &self.host_id),
        };

        if let Some((previous, admission)) = state.take_identity(&id) {
            tracing::info!(
                meeting = %self.meeting_id,
                participant = %id,
                "Connection superseded by a new one"
            );
            previous.close(CLOSE_SUPERSEDED, "Connection superseded");
            if admission == Admission::Active {
                let left = SignalMessage::notice(MessageType::UserLeft, &id, &previous.display_name);
                state.broadcast(&left, &id);
            }
        }

        let participant = Participant::new(id.clone(), endpoint);
        let joined = Joined {
            participant: ParticipantRef {
                id: id.clone(),
                connection_id: participant.connection_id,
            },
            admission: if id == self.host_id {
                Admission::Active
            } else {
                Admission::Waiting
            },
        };

        match joined.admission {
            Admission::Active => self.admit(&mut state, participant),
            Admission::Waiting => {
                self.ask_host(&state, &participant.id, &participant.display_name);
                tracing::info!(
                    meeting = %self.meeting_id,
                    participant = %id,
                    "Participant waiting for host approval"
                );
                state.waiting.insert(id, participant);
            }
        }

        Ok(joined)
    }

    /// Remove a participant after its connection closed, errored, or was evicted.
    ///
    /// Idempotent: returns `false` if that connection is already gone.
    pub async fn leave(self: &Arc<Self>, who: &ParticipantRef) -> bool {
        let removal = {
            let mut state = self.state.lock().await;
            self.remove(&mut state, who)
        };

        match removal {
            Some(removal) => {
                if removal.teardown {
                    self.deregister().await;
                }
                true
            }
            None => false,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        let mut active: Vec<String> = state.active.keys().cloned().collect();
        let mut waiting: Vec<String> = state.waiting.keys().cloned().collect();
        active.sort();
        waiting.sort();
        SessionSnapshot {
            active,
            waiting,
            closed: state.closed,
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Move a participant into `active`, confirm it, and tell everyone else.
    pub(crate) fn admit(&self, state: &mut SessionState, participant: Participant) {
        let confirmation = SignalMessage::notice(
            MessageType::UserRequestAccepted,
            &participant.id,
            &participant.display_name,
        )
        .to(&participant.id);
        let joined =
            SignalMessage::notice(MessageType::UserJoined, &participant.id, &participant.display_name);

        participant.deliver(&confirmation);
        state.broadcast(&joined, &participant.id);

        tracing::info!(
            meeting = %self.meeting_id,
            participant = %participant.id,
            "Participant admitted"
        );
        state.active.insert(participant.id.clone(), participant);
    }

    /// Send the host a `USER_REQUEST` on behalf of a waiting participant.
    pub(crate) fn ask_host(&self, state: &SessionState, id: &str, display_name: &str) {
        let request =
            SignalMessage::notice(MessageType::UserRequest, id, display_name).to(&self.host_id);
        if !state.unicast(&self.host_id, &request) {
            tracing::debug!(
                meeting = %self.meeting_id,
                participant = %id,
                "Host not present, admission request not delivered"
            );
        }
    }

    /// Take a participant out of the session, announcing it if it was active.
    ///
    /// Decides teardown: the session ends when its last active participant
    /// leaves, or when nobody at all is left.
    pub(crate) fn remove(&self, state: &mut SessionState, who: &ParticipantRef) -> Option<Removal> {
        let (participant, admission) = state.take(who)?;

        if admission == Admission::Active {
            let left =
                SignalMessage::notice(MessageType::UserLeft, &participant.id, &participant.display_name);
            state.broadcast(&left, &participant.id);
        }

        let teardown = !state.closed
            && state.active.is_empty()
            && (admission == Admission::Active || state.waiting.is_empty());
        if teardown {
            state.closed = true;
        }

        tracing::info!(
            meeting = %self.meeting_id,
            participant = %participant.id,
            was_active = admission == Admission::Active,
            "Participant removed"
        );

        Some(Removal {
            participant,
            teardown,
        })
    }

    /// Drop this session from the registry. Call without holding the state lock.
    pub(crate) async fn deregister(self: &Arc<Self>) {
        if let Some(sessions) = self.registry.upgrade() {
            registry::remove_session(&sessions, self).await;
        }
        tracing::info!(meeting = %self.meeting_id, "Session ended");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::participant::{self, CLOSE_SUPERSEDED, Mailbox, Outbound};
    use crate::registry::SessionRegistry;

    pub(crate) struct Peer {
        pub(crate) who: ParticipantRef,
        pub(crate) admission: Admission,
        pub(crate) mailbox: Mailbox,
    }

    impl Peer {
        /// Next queued frame, if any. Deliveries are synchronous, so
        /// everything a transition sends is queued by the time it returns.
        pub(crate) fn frame(&mut self) -> Option<Outbound> {
            self.mailbox.outbound.try_recv().ok()
        }

        pub(crate) fn message(&mut self) -> Option<SignalMessage> {
            match self.frame()? {
                Outbound::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                other => panic!("expected a text frame, got {other:?}"),
            }
        }

        pub(crate) fn expect(&mut self, kind: MessageType) -> SignalMessage {
            let msg = self.message().unwrap_or_else(|| panic!("expected {kind:?}, got nothing"));
            assert_eq!(msg.kind, kind, "unexpected message {msg:?}");
            msg
        }

        pub(crate) fn assert_silent(&mut self) {
            assert_eq!(self.frame(), None);
        }
    }

    pub(crate) async fn connect(session: &Arc<Session>, identity: Option<&str>, name: &str) -> Peer {
        let (endpoint, mailbox) = participant::connection(name, 16);
        let joined = session
            .join(identity.map(str::to_owned), endpoint)
            .await
            .unwrap();
        Peer {
            who: joined.participant,
            admission: joined.admission,
            mailbox,
        }
    }

    #[tokio::test]
    async fn host_is_admitted_directly() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;

        let mut host = connect(&session, Some("h1"), "Host").await;
        assert_eq!(host.admission, Admission::Active);

        let confirmation = host.expect(MessageType::UserRequestAccepted);
        assert_eq!(confirmation.receiver, "h1");
        host.assert_silent();

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.active, vec!["h1"]);
        assert!(snapshot.waiting.is_empty());
    }

    #[tokio::test]
    async fn guest_waits_and_host_is_asked() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;
        let mut host = connect(&session, Some("h1"), "Host").await;
        host.expect(MessageType::UserRequestAccepted);

        let mut guest = connect(&session, Some("u1"), "Ada").await;
        assert_eq!(guest.admission, Admission::Waiting);

        let request = host.expect(MessageType::UserRequest);
        assert_eq!(request.sender, "u1");
        assert_eq!(request.name, "Ada");
        assert_eq!(request.receiver, "h1");
        guest.assert_silent();

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.active, vec!["h1"]);
        assert_eq!(snapshot.waiting, vec!["u1"]);
    }

    #[tokio::test]
    async fn guest_arriving_before_host_waits_unannounced() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;

        let mut guest = connect(&session, Some("u1"), "Ada").await;
        assert_eq!(guest.admission, Admission::Waiting);
        guest.assert_silent();

        let mut host = connect(&session, Some("h1"), "Host").await;
        host.expect(MessageType::UserRequestAccepted);
        host.assert_silent();
        assert_eq!(session.snapshot().await.waiting, vec!["u1"]);
    }

    #[tokio::test]
    async fn unauthenticated_connections_get_sequential_ids() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m2", "m2-2").await;

        let first = connect(&session, None, "Guest").await;
        let second = connect(&session, Some(""), "Guest").await;

        assert_eq!(first.who.id, "m2-1");
        // m2-2 belongs to the host and is never handed out.
        assert_eq!(second.who.id, "m2-3");
        assert_eq!(second.admission, Admission::Waiting);
    }

    #[tokio::test]
    async fn reconnecting_identity_supersedes_the_old_connection() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;
        let mut host = connect(&session, Some("h1"), "Host").await;
        host.expect(MessageType::UserRequestAccepted);

        let mut old = connect(&session, Some("u1"), "Ada").await;
        host.expect(MessageType::UserRequest);
        let new = connect(&session, Some("u1"), "Ada").await;
        host.expect(MessageType::UserRequest);

        assert_eq!(
            old.frame(),
            Some(Outbound::Close {
                code: CLOSE_SUPERSEDED,
                reason: "Connection superseded".into()
            })
        );
        assert_ne!(old.who, new.who);

        // The old connection's late disconnect must not remove its successor.
        assert!(!session.leave(&old.who).await);
        assert_eq!(session.snapshot().await.waiting, vec!["u1"]);
    }

    #[tokio::test]
    async fn last_active_leaving_tears_the_session_down() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;
        let mut host = connect(&session, Some("h1"), "Host").await;
        host.expect(MessageType::UserRequestAccepted);
        let mut guest = connect(&session, Some("u1"), "Ada").await;
        host.expect(MessageType::UserRequest);

        assert!(session.leave(&host.who).await);
        assert!(session.is_closed().await);
        assert!(registry.get("m1").await.is_none());
        // Waiting participants are orphaned, not disconnected.
        guest.assert_silent();
        assert_eq!(session.snapshot().await.waiting, vec!["u1"]);

        let (endpoint, _mailbox) = participant::connection("Late", 4);
        assert!(matches!(
            session.join(Some("u2".into()), endpoint).await,
            Err(SessionClosed(_))
        ));

        let fresh = registry.get_or_create("m1", "h1").await;
        assert!(!Arc::ptr_eq(&fresh, &session));
        assert_eq!(fresh.snapshot().await, SessionSnapshot::default());
    }

    #[tokio::test]
    async fn session_of_only_waiting_participants_ends_when_empty() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;
        let guest = connect(&session, Some("u1"), "Ada").await;

        assert!(session.leave(&guest.who).await);
        assert!(session.is_closed().await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_keep_active_and_waiting_disjoint() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;
        let host = connect(&session, Some("h1"), "Host").await;

        let workers: Vec<_> = (0..8)
            .map(|i| {
                let session = session.clone();
                let host = host.who.clone();
                tokio::spawn(async move {
                    // Two workers share each identity, so joins supersede each other.
                    let id = format!("u{}", i % 4);
                    for _ in 0..50 {
                        let (endpoint, _mailbox) = participant::connection("Guest", 4);
                        let joined = session.join(Some(id.clone()), endpoint).await.unwrap();
                        let accept =
                            SignalMessage::notice(MessageType::UserRequestAccepted, "", "").to(&id);
                        session.route(&host, accept).await;
                        tokio::task::yield_now().await;
                        session.leave(&joined.participant).await;
                    }
                })
            })
            .collect();

        let observer = {
            let session = session.clone();
            tokio::spawn(async move {
                for _ in 0..500 {
                    let snapshot = session.snapshot().await;
                    assert!(
                        snapshot.active.iter().all(|id| !snapshot.waiting.contains(id)),
                        "participant in both maps: {snapshot:?}"
                    );
                    assert!(snapshot.active.contains(&"h1".to_owned()));
                    tokio::task::yield_now().await;
                }
            })
        };

        for worker in workers {
            worker.await.unwrap();
        }
        observer.await.unwrap();

        let snapshot = session.snapshot().await;
        assert_eq!(snapshot.active, vec!["h1"]);
        assert!(snapshot.waiting.is_empty());
        assert!(!snapshot.closed);
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let registry = SessionRegistry::new();
        let session = registry.get_or_create("m1", "h1").await;
        let mut host = connect(&session, Some("h1"), "Host").await;
        let mut guest = connect(&session, Some("u1"), "Ada").await;
        host.expect(MessageType::UserRequestAccepted);
        host.expect(MessageType::UserRequest);

        let mut state = session.state.lock().await;
        let waiting = state.waiting.remove("u1").unwrap();
        session.admit(&mut state, waiting);
        drop(state);
        host.expect(MessageType::UserJoined);
        guest.expect(MessageType::UserRequestAccepted);

        assert!(session.leave(&guest.who).await);
        assert!(!session.leave(&guest.who).await);

        let left = host.expect(MessageType::UserLeft);
        assert_eq!(left.sender, "u1");
        host.assert_silent();
        assert_eq!(session.snapshot().await.active, vec!["h1"]);
    }
}
