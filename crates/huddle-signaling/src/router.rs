//! Message routing: the single entry point for every inbound message.
//!
//! The router stamps the sender's session identity onto the message, then
//! either relays it (offer/answer/ICE), or turns it into an admission
//! transition. Nothing is ever reported back to the sender: unknown
//! recipients, stale decisions, and unrecognized types are dropped.

use crate::message::{MessageType, SignalMessage};
use crate::participant::{CLOSE_NORMAL, CLOSE_REJECTED};
use crate::session::{Admission, ParticipantRef, Session, SessionState};
use std::sync::Arc;

impl SessionState {
    /// Deliver to one active participant. Returns `false` if it is not active.
    pub(crate) fn unicast(&self, recipient: &str, message: &SignalMessage) -> bool {
        match self.active.get(recipient) {
            Some(participant) => {
                participant.deliver(message);
                true
            }
            None => false,
        }
    }

    /// Deliver to every active participant except `exclude`.
    ///
    /// Best effort per recipient: a full or closed queue only affects that
    /// recipient. Returns how many recipients were attempted.
    pub(crate) fn broadcast(&self, message: &SignalMessage, exclude: &str) -> usize {
        let mut attempted = 0;
        for participant in self.active.values().filter(|p| p.id != exclude) {
            participant.deliver(message);
            attempted += 1;
        }
        attempted
    }
}

impl Session {
    /// Route one inbound message from `from`.
    ///
    /// Client-supplied `sender` and `name` are overwritten with the
    /// participant's session identity before anything else happens.
    pub async fn route(self: &Arc<Self>, from: &ParticipantRef, mut message: SignalMessage) {
        let mut state = self.state.lock().await;

        let Some((sender, admission)) = state.find(from) else {
            tracing::debug!(
                meeting = %self.meeting_id(),
                participant = %from.id,
                "Dropping message from a participant no longer in the session"
            );
            return;
        };
        message.sender = sender.id.clone();
        message.name = sender.display_name.clone();

        let teardown = match message.kind {
            kind if kind.is_relay() => {
                if admission != Admission::Active {
                    tracing::debug!(
                        meeting = %self.meeting_id(),
                        participant = %message.sender,
                        kind = ?message.kind,
                        "Dropping signaling from a participant not yet admitted"
                    );
                } else if !state.unicast(&message.receiver, &message) {
                    tracing::debug!(
                        meeting = %self.meeting_id(),
                        participant = %message.sender,
                        receiver = %message.receiver,
                        "Dropping signaling for an inactive receiver"
                    );
                }
                false
            }

            // Re-request: only meaningful while waiting. The host and admitted
            // participants never move back into the waiting room.
            MessageType::UserRequest => {
                if admission == Admission::Waiting {
                    self.ask_host(&state, &message.sender, &message.name);
                }
                false
            }

            MessageType::UserRequestAccepted => {
                if admission == Admission::Active && message.sender == self.host_id() {
                    let candidate = state.waiting.remove(&message.receiver);
                    match candidate {
                        Some(participant) => self.admit(&mut state, participant),
                        None => tracing::debug!(
                            meeting = %self.meeting_id(),
                            receiver = %message.receiver,
                            "Ignoring stale admission for a participant not waiting"
                        ),
                    }
                }
                false
            }

            MessageType::UserRequestRejected => {
                // The host names the participant it turns away; a waiting
                // participant sending it withdraws its own request.
                let target = if admission == Admission::Active && message.sender == self.host_id() {
                    state
                        .waiting
                        .get(&message.receiver)
                        .map(|p| ParticipantRef {
                            id: p.id.clone(),
                            connection_id: p.connection_id,
                        })
                } else if admission == Admission::Waiting {
                    Some(from.clone())
                } else {
                    None
                };

                match target.and_then(|target| self.remove(&mut state, &target)) {
                    Some(removal) => {
                        tracing::info!(
                            meeting = %self.meeting_id(),
                            participant = %removal.participant.id,
                            "Admission request rejected"
                        );
                        removal
                            .participant
                            .close(CLOSE_REJECTED, "User request rejected");
                        removal.teardown
                    }
                    None => false,
                }
            }

            MessageType::UserLeft => match self.remove(&mut state, from) {
                Some(removal) => {
                    removal.participant.close(CLOSE_NORMAL, "Left meeting");
                    removal.teardown
                }
                None => false,
            },

            _ => {
                tracing::debug!(
                    meeting = %self.meeting_id(),
                    participant = %message.sender,
                    kind = ?message.kind,
                    "Dropping message of a type clients may not send"
                );
                false
            }
        };

        drop(state);
        if teardown {
            self.deregister().await;
        }
    }
}
