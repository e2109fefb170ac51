//! # huddle-signaling
//!
//! WebRTC signaling relay with a host-gated waiting room.
//!
//! Architecture:
//! - Each meeting with at least one connection has a live [`Session`]
//! - The meeting's host is admitted directly; everyone else waits until the
//!   host accepts or rejects them
//! - Offers, answers, and ICE candidates are relayed between admitted
//!   participants without being interpreted; media never touches the server
//!
//! The relay owns no durable state. Meetings and their hosts are looked up
//! through a [`MeetingDirectory`]; identities come from the web app's session
//! cookie.

pub mod handler;
pub mod message;
pub mod participant;
pub mod registry;
pub mod router;
pub mod session;

pub use message::{MessageType, SignalMessage};
pub use registry::{RegistryStats, SessionRegistry};
pub use session::{Admission, ParticipantRef, Session};

use axum::{Router, routing::get};
use huddle_common::config::SignalingConfig;
use huddle_common::error::HuddleResult;
use huddle_db::{Database, postgres, repository::meetings};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Resolves meetings to their hosts.
pub trait MeetingDirectory: Send + Sync + 'static {
    /// The host's user ID, or `None` if no such meeting exists.
    fn host_of(
        &self,
        meeting_id: &str,
    ) -> impl Future<Output = HuddleResult<Option<String>>> + Send;

    fn is_healthy(&self) -> impl Future<Output = bool> + Send {
        async { true }
    }
}

impl MeetingDirectory for Database {
    async fn host_of(&self, meeting_id: &str) -> HuddleResult<Option<String>> {
        Ok(meetings::find_host_id(&self.pg, meeting_id).await?)
    }

    async fn is_healthy(&self) -> bool {
        postgres::health_check(&self.pg).await
    }
}

/// Signaling server state, shared across all connections.
pub struct SignalingState<D> {
    pub registry: SessionRegistry,
    pub directory: D,
    /// Secret for decrypting session cookies. `None` disables authentication.
    pub session_secret: Option<String>,
    pub outbound_capacity: usize,
    pub close_flush_timeout: Duration,
}

impl<D: MeetingDirectory> SignalingState<D> {
    pub fn new(directory: D, session_secret: Option<String>, signaling: &SignalingConfig) -> Self {
        Self {
            registry: SessionRegistry::new(),
            directory,
            session_secret,
            outbound_capacity: signaling.outbound_queue_capacity,
            close_flush_timeout: signaling.close_flush_timeout(),
        }
    }
}

/// Build the signaling router.
pub fn build_router<D: MeetingDirectory>(state: SignalingState<D>) -> Router {
    Router::new()
        .route("/", get(handler::ws_handler::<D>))
        .route("/health", get(handler::health::<D>))
        .route("/stats", get(handler::stats::<D>))
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
