//! WebSocket connection entry point.
//!
//! Connection flow:
//!
//! 1. Client opens `GET /?meetingId=<id>&name=<display name>`
//! 2. The meeting is resolved to its host; unknown meetings are refused
//!    before the upgrade
//! 3. The session cookie, if any, is decrypted into an identity
//! 4. After the upgrade the connection joins its session: the host goes
//!    straight in, everyone else lands in the waiting room
//! 5. Inbound frames are routed in arrival order; outbound frames are
//!    drained from the participant's queue by a separate writer task
//! 6. When the reader stops the participant is removed exactly once, and the
//!    writer gets a short grace period to flush before it is aborted

use crate::message::SignalMessage;
use crate::participant::{self, Eviction, Mailbox, Outbound};
use crate::session::{ParticipantRef, Session, SessionClosed};
use crate::{MeetingDirectory, RegistryStats, SignalingState};
use axum::{
    Json,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use axum_extra::extract::CookieJar;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use huddle_common::auth::{self, SECURE_SESSION_COOKIE, SESSION_COOKIE, SessionClaims};
use huddle_common::error::{HuddleError, HuddleResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

const UNKNOWN_NAME: &str = "unknown";

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "meetingId")]
    pub meeting_id: Option<String>,
    pub name: Option<String>,
}

/// Who is connecting, resolved before the upgrade.
struct Caller {
    meeting_id: String,
    host_id: String,
    identity: Option<String>,
    display_name: String,
}

/// WebSocket upgrade handler.
pub async fn ws_handler<D: MeetingDirectory>(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    jar: CookieJar,
    State(state): State<Arc<SignalingState<D>>>,
) -> HuddleResult<Response> {
    let meeting_id = params
        .meeting_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| HuddleError::validation("Invalid Request"))?;

    let host_id = state
        .directory
        .host_of(&meeting_id)
        .await?
        .ok_or_else(|| HuddleError::not_found("Meeting"))?;

    let claims = authenticate(state.session_secret.as_deref(), &jar);
    let display_name = claims
        .as_ref()
        .and_then(SessionClaims::display_name)
        .map(str::to_owned)
        .or(params.name.filter(|name| !name.is_empty()))
        .unwrap_or_else(|| UNKNOWN_NAME.to_owned());

    let caller = Caller {
        meeting_id,
        host_id,
        identity: claims.map(|c| c.sub),
        display_name,
    };
    Ok(ws.on_upgrade(move |socket| handle_connection(socket, state, caller)))
}

/// Decrypt the session cookie. Any failure leaves the caller unauthenticated.
fn authenticate(secret: Option<&str>, jar: &CookieJar) -> Option<SessionClaims> {
    let secret = secret?;
    let cookie = jar
        .get(SECURE_SESSION_COOKIE)
        .or_else(|| jar.get(SESSION_COOKIE))?;

    match auth::decrypt_session_token(cookie.value(), secret) {
        Ok(claims) => Some(claims),
        Err(e) => {
            tracing::debug!("Session token rejected, connecting unauthenticated: {e}");
            None
        }
    }
}

/// Drive a single signaling connection until it closes.
async fn handle_connection<D: MeetingDirectory>(
    socket: WebSocket,
    state: Arc<SignalingState<D>>,
    caller: Caller,
) {
    let (sink, stream) = socket.split();
    let (mut endpoint, mailbox) =
        participant::connection(caller.display_name, state.outbound_capacity);
    let Mailbox {
        connection_id,
        outbound,
        eviction,
    } = mailbox;

    // A session that ended between lookup and join is closed; it deregisters
    // itself, so the next lookup yields a fresh one.
    let (session, joined) = loop {
        let session = state
            .registry
            .get_or_create(&caller.meeting_id, &caller.host_id)
            .await;
        match session.join(caller.identity.clone(), endpoint).await {
            Ok(joined) => break (session, joined),
            Err(SessionClosed(returned)) => {
                state.registry.remove(&session).await;
                endpoint = returned;
            }
        }
    };

    tracing::debug!(
        meeting = %caller.meeting_id,
        participant = %joined.participant.id,
        connection = %connection_id,
        admission = ?joined.admission,
        "Signaling WebSocket connected"
    );

    let writer = tokio::spawn(write_frames(sink, outbound));
    read_frames(stream, &session, &joined.participant, eviction).await;

    session.leave(&joined.participant).await;

    let abort = writer.abort_handle();
    if tokio::time::timeout(state.close_flush_timeout, writer)
        .await
        .is_err()
    {
        tracing::debug!(connection = %connection_id, "Writer did not flush in time, aborting");
        abort.abort();
    }

    tracing::debug!(
        meeting = %caller.meeting_id,
        participant = %joined.participant.id,
        connection = %connection_id,
        "Signaling WebSocket disconnected"
    );
}

/// Receive loop. Returns when the peer goes away or the session hangs up on it.
async fn read_frames(
    mut stream: SplitStream<WebSocket>,
    session: &Arc<Session>,
    who: &ParticipantRef,
    eviction: Eviction,
) {
    loop {
        tokio::select! {
            _ = eviction.notified() => {
                tracing::debug!(participant = %who.id, "Connection closed by the session");
                return;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<SignalMessage>(text.as_str()) {
                        Ok(message) => session.route(who, message).await,
                        Err(e) => {
                            tracing::debug!(participant = %who.id, "Dropping malformed message: {e}");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                // Ping/pong are answered by the socket; binary frames carry nothing for us.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(participant = %who.id, "WebSocket error: {e}");
                    return;
                }
            }
        }
    }
}

/// Writer task: drain the participant's queue into the socket.
async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(frame) = outbound.recv().await {
        let sent = match frame {
            Outbound::Text(text) => sink.send(Message::Text(text.into())).await,
            Outbound::Close { code, reason } => {
                let close = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                let _ = sink.send(Message::Close(Some(close))).await;
                break;
            }
        };
        if sent.is_err() {
            break;
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health<D: MeetingDirectory>(
    State(state): State<Arc<SignalingState<D>>>,
) -> Json<HealthResponse> {
    let healthy = state.directory.is_healthy().await;

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn stats<D: MeetingDirectory>(
    State(state): State<Arc<SignalingState<D>>>,
) -> Json<RegistryStats> {
    Json(state.registry.stats().await)
}
