//! Raw-frame transport handler
//!
//! Clients speak newline-delimited JSON frames over a WebSocket at
//! `/ws`. WebSocket message boundaries are ignored: payload bytes feed
//! the frame codec's buffer, so one message may carry several frames and
//! a frame may arrive in pieces. A payload without a trailing delimiter
//! is treated as a complete line.

use std::ops::ControlFlow;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cinemate_core::auth::Handshake;
use cinemate_core::models::{ChatMessage, ConnectionId, MessageEnvelope, RoomId};
use cinemate_core::persist::persist_best_effort;

use crate::dispatcher::{Delivery, DeliveryKind};
use crate::error::Error;
use crate::protocol::frame::{headers, Frame, FrameCodec, FrameCommand};
use crate::registry::DeliverySender;
use crate::server::AppState;
use crate::session::TransportKind;

pub async fn frame_ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Authentication happens on the CONNECT frame, not at upgrade
    ws.max_message_size(state.relay_config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Where a SEND frame's traffic ends up
#[derive(Debug, PartialEq, Eq)]
enum SendRoute {
    /// Broadcast to the destination as-is
    Topic(String),
    /// Application verb mapped onto the room topic; `persist` marks the
    /// chat verb whose payload goes to the message store
    AppVerb { room_id: String, persist: bool },
    /// Silently ignored
    Drop,
}

/// Application destination routing: `/app/chat.{verb}/{roomId}` maps to
/// `/topic/{roomId}`, direct `/topic/...` sends pass through
fn route_send(destination: &str) -> SendRoute {
    if let Some(rest) = destination.strip_prefix("/app/chat.") {
        let Some((verb, room_id)) = rest.split_once('/') else {
            return SendRoute::Drop;
        };
        if room_id.is_empty() {
            return SendRoute::Drop;
        }
        return match verb {
            "sendMessage" => SendRoute::AppVerb {
                room_id: room_id.to_string(),
                persist: true,
            },
            "addUser" | "removeUser" | "videoUpdate" | "queueUpdate" | "videoVote" => {
                SendRoute::AppVerb {
                    room_id: room_id.to_string(),
                    persist: false,
                }
            }
            _ => SendRoute::Drop,
        };
    }

    if destination.starts_with("/topic/") {
        return SendRoute::Topic(destination.to_string());
    }

    SendRoute::Drop
}

struct FrameConnection {
    connection_id: ConnectionId,
    control_tx: mpsc::Sender<Frame>,
    delivery_tx: DeliverySender,
    authenticated: bool,
}

impl FrameConnection {
    /// Queue a server frame ahead of pending deliveries
    fn reply(&self, frame: Frame) {
        if self.control_tx.try_send(frame).is_err() {
            warn!(
                connection_id = %self.connection_id,
                "Control channel saturated, dropping server frame"
            );
        }
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let connection_id = ConnectionId::new();
    let cancel = state
        .sessions
        .register(connection_id.clone(), TransportKind::Frame);

    let (delivery_tx, mut delivery_rx) =
        mpsc::channel(state.relay_config.outbound_buffer);
    let (control_tx, mut control_rx) = mpsc::channel::<Frame>(64);

    let (mut sink, mut stream) = socket.split();

    // Writer: control frames first, then deliveries rendered as MESSAGE
    // frames with the receiving subscription's own id
    let writer_conn = connection_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                biased;
                control = control_rx.recv() => control,
                delivery = delivery_rx.recv() => delivery.map(|delivery: Delivery| {
                    Frame::message(
                        &delivery.destination,
                        &delivery.subscription_id,
                        &delivery.content_type,
                        delivery.body.to_string(),
                    )
                }),
            };

            let Some(frame) = frame else { break };
            let line = match frame.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!(connection_id = %writer_conn, error = %e, "Unencodable frame");
                    continue;
                }
            };
            if sink.send(Message::Text(line.into())).await.is_err() {
                debug!(connection_id = %writer_conn, "Write failed, transport gone");
                break;
            }
        }
    });

    let mut connection = FrameConnection {
        connection_id: connection_id.clone(),
        control_tx,
        delivery_tx,
        authenticated: false,
    };
    let mut codec = FrameCodec::new(state.relay_config.max_frame_bytes);
    let mut buf = BytesMut::new();

    loop {
        let message = tokio::select! {
            () = cancel.cancelled() => {
                debug!(connection_id = %connection_id, "Connection cancelled by sweeper");
                break;
            }
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                buf.extend_from_slice(text.as_bytes());
                if !text.ends_with('\n') {
                    buf.extend_from_slice(b"\n");
                }
            }
            Some(Ok(Message::Binary(bytes))) => {
                buf.extend_from_slice(&bytes);
                if !bytes.ends_with(b"\n") {
                    buf.extend_from_slice(b"\n");
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                state.sessions.touch(&connection_id);
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }

        if drain_frames(&state, &mut connection, &mut codec, &mut buf)
            .await
            .is_break()
        {
            break;
        }
    }

    // Same deregistration path for every exit: error, close, cancel.
    // Deregistering drops the registry's sender clones; dropping ours
    // lets the writer drain queued frames and exit.
    state.room.disconnect(&connection_id);
    drop(connection);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    info!(connection_id = %connection_id, "Frame connection closed");
}

/// Decode and handle every complete frame in the buffer. Protocol
/// errors get an ERROR reply and the connection stays open.
async fn drain_frames(
    state: &AppState,
    connection: &mut FrameConnection,
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
) -> ControlFlow<()> {
    use tokio_util::codec::Decoder;

    loop {
        match codec.decode(buf) {
            Ok(Some(frame)) => handle_frame(state, connection, frame).await?,
            Ok(None) => return ControlFlow::Continue(()),
            Err(Error::UnknownCommand(name)) => {
                debug!(
                    connection_id = %connection.connection_id,
                    command = %name,
                    "Unrecognized command"
                );
                connection.reply(Frame::error(format!("unknown command: {name}")));
            }
            Err(e) => {
                debug!(
                    connection_id = %connection.connection_id,
                    error = %e,
                    "Malformed frame"
                );
                connection.reply(Frame::error(e.to_string()));
            }
        }
    }
}

async fn handle_frame(
    state: &AppState,
    connection: &mut FrameConnection,
    frame: Frame,
) -> ControlFlow<()> {
    state.sessions.touch(&connection.connection_id);

    match frame.command {
        FrameCommand::Connect => handle_connect(state, connection, &frame).await,
        FrameCommand::Subscribe => {
            // Required headers were validated by the codec
            let destination = frame.header(headers::DESTINATION).unwrap_or_default();
            let id = frame.header(headers::ID).unwrap_or_default();
            state.registry.subscribe(
                &connection.connection_id,
                id,
                destination,
                connection.delivery_tx.clone(),
            );
            ControlFlow::Continue(())
        }
        FrameCommand::Unsubscribe => {
            let id = frame.header(headers::ID).unwrap_or_default();
            state
                .registry
                .unsubscribe(&connection.connection_id, id);
            ControlFlow::Continue(())
        }
        FrameCommand::Send => {
            handle_send(state, connection, &frame);
            ControlFlow::Continue(())
        }
        FrameCommand::Disconnect => ControlFlow::Break(()),
        FrameCommand::Connected | FrameCommand::Message | FrameCommand::Error => {
            connection.reply(Frame::error(format!(
                "{} frames are server-generated",
                frame.command
            )));
            ControlFlow::Continue(())
        }
    }
}

async fn handle_connect(
    state: &AppState,
    connection: &mut FrameConnection,
    frame: &Frame,
) -> ControlFlow<()> {
    if connection.authenticated {
        connection.reply(Frame::connected());
        return ControlFlow::Continue(());
    }

    let handshake = Handshake {
        token: frame.header(headers::PASSCODE).map(str::to_string),
        username: frame.header(headers::LOGIN).map(str::to_string),
        avatar_url: None,
    };

    match state.authenticator.authenticate(&handshake).await {
        Ok(identity) => {
            state
                .sessions
                .set_identity(&connection.connection_id, identity);
            connection.authenticated = true;
            connection.reply(Frame::connected());
            ControlFlow::Continue(())
        }
        Err(e) => {
            warn!(
                connection_id = %connection.connection_id,
                error = %e,
                "Handshake rejected"
            );
            connection.reply(Frame::error("authentication rejected"));
            ControlFlow::Break(())
        }
    }
}

fn handle_send(state: &AppState, connection: &FrameConnection, frame: &Frame) {
    state.sessions.record_message(&connection.connection_id);

    let raw_body = frame.body.as_deref().unwrap_or_default();
    let body: Value = match serde_json::from_str(raw_body) {
        Ok(body) => body,
        Err(e) => {
            // Local decode failure: drop the message, keep the connection
            debug!(
                connection_id = %connection.connection_id,
                error = %e,
                "SEND body is not valid JSON, discarding"
            );
            return;
        }
    };

    let destination = frame.header(headers::DESTINATION).unwrap_or_default();
    match route_send(destination) {
        SendRoute::Topic(topic) => {
            state
                .dispatcher
                .dispatch(&MessageEnvelope::json(topic, body), DeliveryKind::Message);
        }
        SendRoute::AppVerb { room_id, persist } => {
            let room_id = RoomId::from(room_id);
            state.dispatcher.dispatch(
                &MessageEnvelope::json(room_id.topic(), body.clone()),
                DeliveryKind::Message,
            );
            if persist {
                match serde_json::from_value::<ChatMessage>(body) {
                    Ok(chat) => {
                        persist_best_effort(state.store.clone(), chat, room_id);
                    }
                    Err(e) => debug!(
                        room_id = %room_id,
                        error = %e,
                        "Message shape not persistable, relaying only"
                    ),
                }
            }
        }
        SendRoute::Drop => {
            debug!(
                connection_id = %connection.connection_id,
                destination,
                "SEND to unroutable destination, ignoring"
            );
        }
    }
}
