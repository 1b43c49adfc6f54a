//! Realtime presence endpoint.
//!
//! Lifecycle per connection: resolve id -> announce id -> register row ->
//! forward count broadcasts until the client disconnects or tears down.

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream, StreamExt},
    SinkExt,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::{
    middleware::auth::optional_user_id,
    models::presence_session::NewPresenceSession,
    services::{
        presence::new_connection_id, HeartbeatOutcome, PresenceEvent, PresenceService,
        SocketAttachments,
    },
    state::AppState,
};

const MAX_CLIENT_AGENT_LEN: usize = 512;

/// Messages sent from the browser.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The tab is closing; retire the session now.
    AboutToUnload,
    /// Keeps the session fresh for the stale sweep.
    Heartbeat,
}

/// Messages sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionAccepted { connection_id: String },
    ActiveCountChanged { count: i64 },
    Pong,
    Error { message: String },
}

impl From<PresenceEvent> for ServerMessage {
    fn from(event: PresenceEvent) -> Self {
        match event {
            PresenceEvent::ActiveCountChanged { count } => ServerMessage::ActiveCountChanged { count },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HandshakeParams {
    pub token: Option<String>,
    /// Connection id from a previous handshake of the same tab.
    pub resume: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to send message: {0}")]
    Send(#[source] axum::Error),
}

#[derive(Debug)]
struct Handshake {
    resume: Option<String>,
    user_id: Option<String>,
    remote_address: Option<String>,
    client_agent: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum FrameOutcome {
    Reply(ServerMessage),
    Ignore,
    Teardown,
    Retired,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Disconnect,
    Teardown,
    /// The row was retired while this socket stayed open.
    Retired,
}

type SocketSink = SplitSink<WebSocket, Message>;

/// GET /api/presence/ws
pub async fn presence_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<HandshakeParams>,
    headers: HeaderMap,
) -> Response {
    let handshake = Handshake {
        user_id: optional_user_id(&headers, params.token.as_deref(), &state.config.jwt_secret),
        remote_address: client_address(&headers, Some(peer)),
        client_agent: client_agent(&headers),
        resume: params.resume,
    };
    ws.on_upgrade(move |socket| run_session(socket, state.presence, state.attachments, handshake))
}

async fn run_session(
    socket: WebSocket,
    presence: PresenceService,
    attachments: SocketAttachments,
    handshake: Handshake,
) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe first so the count that includes this connection is delivered.
    let mut updates = presence.subscribe();

    let session = register(&presence, &attachments, handshake).await;
    let connection_id = session.connection_id.clone();

    let accepted = ServerMessage::ConnectionAccepted {
        connection_id: connection_id.clone(),
    };
    let end = match send_message(&mut sender, &accepted).await {
        Ok(()) => {
            forward_until_closed(&mut sender, &mut receiver, &mut updates, &presence, &session)
                .await
        }
        Err(err) => {
            tracing::debug!(%connection_id, error = %err, "Client left before handshake completed");
            SessionEnd::Disconnect
        }
    };

    let remaining = attachments.detach(&connection_id);
    match end {
        SessionEnd::Teardown => {
            presence.on_explicit_teardown(&connection_id).await;
            // Close from our side so no later disconnect is processed for this id.
            close_socket(&mut sender, &connection_id, close_code::NORMAL, "teardown").await;
        }
        SessionEnd::Retired => {
            // The client reconnects and is given a fresh id.
            close_socket(&mut sender, &connection_id, close_code::AGAIN, "session retired").await;
        }
        SessionEnd::Disconnect if remaining == 0 => presence.on_disconnect(&connection_id).await,
        SessionEnd::Disconnect => {
            tracing::debug!(%connection_id, remaining, "Connection id still attached; row kept live")
        }
    }
    tracing::debug!(%connection_id, ?end, "Realtime connection finished");
}

async fn close_socket(
    sender: &mut SocketSink,
    connection_id: &str,
    code: u16,
    reason: &'static str,
) {
    let close = Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }));
    if let Err(err) = sender.send(close).await {
        tracing::debug!(connection_id, reason, error = %err, "Server-side close failed");
    }
}

/// Resolves the connection id, attaches this socket to it and records the row.
async fn register(
    presence: &PresenceService,
    attachments: &SocketAttachments,
    handshake: Handshake,
) -> NewPresenceSession {
    let mut session = NewPresenceSession {
        connection_id: presence
            .resolve_connection_id(handshake.resume.as_deref())
            .await,
        user_id: handshake.user_id,
        remote_address: handshake.remote_address,
        client_agent: handshake.client_agent,
    };
    let resumed = handshake.resume.as_deref() == Some(session.connection_id.as_str());

    attachments.attach(&session.connection_id);
    let tracked = presence.on_connect(session.clone()).await;

    if resumed && !tracked {
        // The resumed row was retired between lookup and upsert.
        attachments.detach(&session.connection_id);
        session.connection_id = new_connection_id();
        attachments.attach(&session.connection_id);
        presence.on_connect(session.clone()).await;
    }
    session
}

async fn forward_until_closed(
    sender: &mut SocketSink,
    receiver: &mut SplitStream<WebSocket>,
    updates: &mut broadcast::Receiver<PresenceEvent>,
    presence: &PresenceService,
    session: &NewPresenceSession,
) -> SessionEnd {
    let connection_id = session.connection_id.as_str();
    loop {
        tokio::select! {
            incoming = receiver.next() => {
                let outcome = match incoming {
                    Some(Ok(message)) => handle_frame(message, presence, session).await,
                    Some(Err(err)) => {
                        tracing::debug!(connection_id, error = %err, "Realtime transport error");
                        FrameOutcome::Closed
                    }
                    None => FrameOutcome::Closed,
                };
                match outcome {
                    FrameOutcome::Reply(reply) => {
                        if let Err(err) = send_message(sender, &reply).await {
                            tracing::debug!(connection_id, error = %err, "Failed to reply");
                            return SessionEnd::Disconnect;
                        }
                    }
                    FrameOutcome::Ignore => {}
                    FrameOutcome::Teardown => return SessionEnd::Teardown,
                    FrameOutcome::Retired => return SessionEnd::Retired,
                    FrameOutcome::Closed => return SessionEnd::Disconnect,
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(event) => {
                        if let Err(err) = send_message(sender, &ServerMessage::from(event)).await {
                            tracing::debug!(connection_id, error = %err, "Failed to forward count");
                            return SessionEnd::Disconnect;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(connection_id, missed, "Realtime client lagged behind count updates");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::error!(connection_id, "Presence broadcast channel closed");
                        return SessionEnd::Disconnect;
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    message: Message,
    presence: &PresenceService,
    session: &NewPresenceSession,
) -> FrameOutcome {
    match message {
        Message::Text(text) => match parse_client_message(text.as_str()) {
            Ok(ClientMessage::AboutToUnload) => FrameOutcome::Teardown,
            Ok(ClientMessage::Heartbeat) => match presence.heartbeat(session).await {
                HeartbeatOutcome::Retired => FrameOutcome::Retired,
                _ => FrameOutcome::Reply(ServerMessage::Pong),
            },
            Err(message) => FrameOutcome::Reply(ServerMessage::Error { message }),
        },
        Message::Binary(_) => FrameOutcome::Reply(ServerMessage::Error {
            message: "Binary messages not supported".to_string(),
        }),
        Message::Ping(_) => match presence.heartbeat(session).await {
            HeartbeatOutcome::Retired => FrameOutcome::Retired,
            _ => FrameOutcome::Ignore,
        },
        Message::Pong(_) => FrameOutcome::Ignore,
        Message::Close(_) => FrameOutcome::Closed,
    }
}

fn parse_client_message(text: &str) -> Result<ClientMessage, String> {
    serde_json::from_str(text).map_err(|e| format!("Invalid message: {}", e))
}

async fn send_message(sender: &mut SocketSink, message: &ServerMessage) -> Result<(), SocketError> {
    let json = serde_json::to_string(message)?;
    sender
        .send(Message::Text(json.into()))
        .await
        .map_err(SocketError::Send)
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket peer.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
        })
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

pub fn client_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|agent| !agent.is_empty())
        .map(|agent| agent.chars().take(MAX_CLIENT_AGENT_LEN).collect())
}
