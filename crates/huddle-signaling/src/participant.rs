//! One connected endpoint inside a session.
//!
//! A connection is split in two halves when it is created:
//! - [`Endpoint`] travels into the session and becomes a [`Participant`];
//!   it holds the sending side of the bounded outbound queue.
//! - [`Mailbox`] stays with the connection task; its writer drains the queue
//!   into the socket and its reader watches for the session hanging up.
//!
//! The session never awaits on a participant: delivery is a non-blocking
//! enqueue, so fan-out under the session lock cannot stall on a slow peer.

use crate::message::SignalMessage;
use std::sync::Arc;
use tokio::sync::{Notify, mpsc};
use uuid::Uuid;

/// Close code sent to a participant the host turned away.
pub const CLOSE_REJECTED: u16 = 4000;
/// Close code sent to a connection replaced by a newer one with the same identity.
pub const CLOSE_SUPERSEDED: u16 = 4001;
/// Close code for a participant that announced it is leaving.
pub const CLOSE_NORMAL: u16 = 1000;

/// A frame waiting to be written to a participant's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Write a close frame and stop writing.
    Close { code: u16, reason: String },
}

/// Session-side half of a connection, before it has been given an identity.
#[derive(Debug)]
pub struct Endpoint {
    pub(crate) connection_id: Uuid,
    pub(crate) display_name: String,
    outbound: mpsc::Sender<Outbound>,
    evict: Arc<Notify>,
}

/// Connection-side half: the receiving end of the outbound queue.
#[derive(Debug)]
pub struct Mailbox {
    pub connection_id: Uuid,
    pub outbound: mpsc::Receiver<Outbound>,
    pub eviction: Eviction,
}

/// Raised by the session when it closes or gives up on a connection.
#[derive(Debug, Clone)]
pub struct Eviction(Arc<Notify>);

impl Eviction {
    /// Resolves once the connection has been closed or evicted.
    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// Create both halves of a new connection with a queue of `capacity` frames.
pub fn connection(display_name: impl Into<String>, capacity: usize) -> (Endpoint, Mailbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let evict = Arc::new(Notify::new());
    let connection_id = Uuid::new_v4();

    let endpoint = Endpoint {
        connection_id,
        display_name: display_name.into(),
        outbound: tx,
        evict: evict.clone(),
    };
    let mailbox = Mailbox {
        connection_id,
        outbound: rx,
        eviction: Eviction(evict),
    };
    (endpoint, mailbox)
}

/// Result of handing a frame to a participant's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue was full; the participant has been told to disconnect.
    Evicted,
    /// The connection task is already gone.
    Closed,
}

/// An admitted or waiting participant, owned by its session.
#[derive(Debug)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub(crate) connection_id: Uuid,
    outbound: mpsc::Sender<Outbound>,
    evict: Arc<Notify>,
}

impl Participant {
    pub(crate) fn new(id: String, endpoint: Endpoint) -> Self {
        Self {
            id,
            display_name: endpoint.display_name,
            connection_id: endpoint.connection_id,
            outbound: endpoint.outbound,
            evict: endpoint.evict,
        }
    }

    /// Serialize and enqueue a message.
    pub fn deliver(&self, message: &SignalMessage) -> Delivery {
        match serde_json::to_string(message) {
            Ok(text) => self.enqueue(Outbound::Text(text)),
            Err(e) => {
                tracing::error!(participant = %self.id, "Failed to serialize message: {e}");
                Delivery::Closed
            }
        }
    }

    /// Enqueue a close frame and hang up.
    ///
    /// The writer stops after sending the frame and the reader stops at once,
    /// so the socket is dropped without waiting for the peer's close reply.
    pub fn close(&self, code: u16, reason: &str) -> Delivery {
        let delivery = self.enqueue(Outbound::Close {
            code,
            reason: reason.to_owned(),
        });
        self.evict.notify_one();
        delivery
    }

    fn enqueue(&self, frame: Outbound) -> Delivery {
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    participant = %self.id,
                    connection = %self.connection_id,
                    "Outbound queue full, evicting participant"
                );
                self.evict.notify_one();
                Delivery::Evicted
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}
