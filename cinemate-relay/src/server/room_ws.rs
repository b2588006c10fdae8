//! Room presence channel handler
//!
//! Clients speak verb-style JSON events over a WebSocket at `/socket`.
//! The handshake is authenticated before upgrade; room membership and
//! presence follow the joinRoom/leaveRoom verbs. Every verb is a thin
//! call into the shared [`RoomChannel`].

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use cinemate_core::auth::Handshake;
use cinemate_core::models::{ConnectionId, Identity, RoomId};

use crate::dispatcher::{Delivery, DeliveryKind};
use crate::protocol::room_events::{ClientEvent, ServerEvent};
use crate::server::AppState;
use crate::session::TransportKind;

/// Query parameters for the room channel handshake
#[derive(Debug, Deserialize)]
pub struct RoomWsQuery {
    pub token: Option<String>,
    pub username: Option<String>,
    #[serde(rename = "avatarUrl")]
    pub avatar_url: Option<String>,
}

pub async fn room_ws_handler(
    State(state): State<AppState>,
    Query(query): Query<RoomWsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let handshake = Handshake {
        token: query.token,
        username: query.username,
        avatar_url: query.avatar_url,
    };

    // Reject before upgrading; the relay never admits anonymous sockets
    let identity = match state.authenticator.authenticate(&handshake).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Room channel handshake rejected");
            return (StatusCode::UNAUTHORIZED, "handshake rejected").into_response();
        }
    };

    ws.max_message_size(state.relay_config.max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, identity))
        .into_response()
}

/// Render a delivery as the room-channel event a client expects
fn render(delivery: Delivery) -> ServerEvent {
    match delivery.kind {
        DeliveryKind::Message => ServerEvent::Message(delivery.body),
        DeliveryKind::VideoControl => ServerEvent::VideoControl(delivery.body),
        DeliveryKind::VideoUpdate => ServerEvent::VideoUpdate(delivery.body),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let connection_id = ConnectionId::new();
    let cancel = state
        .sessions
        .register(connection_id.clone(), TransportKind::Room);
    state.sessions.set_identity(&connection_id, identity);

    let (delivery_tx, mut delivery_rx) =
        mpsc::channel::<Delivery>(state.relay_config.outbound_buffer);

    let (mut sink, mut stream) = socket.split();

    let writer_conn = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(delivery) = delivery_rx.recv().await {
            let event = render(delivery);
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(connection_id = %writer_conn, error = %e, "Unencodable event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                debug!(connection_id = %writer_conn, "Write failed, transport gone");
                break;
            }
        }
    });

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
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        if handle_event(&state, &connection_id, &delivery_tx, event).is_none() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Bad event shape: drop it, keep the connection
                        debug!(
                            connection_id = %connection_id,
                            error = %e,
                            "Unparseable room event, discarding"
                        );
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                state.sessions.touch(&connection_id);
            }
            Some(Ok(Message::Binary(_))) => {
                debug!(connection_id = %connection_id, "Ignoring binary message");
            }
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Implicit disconnect: synthesizes LEAVE if joined, then deregisters
    state.room.disconnect(&connection_id);
    drop(delivery_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    info!(connection_id = %connection_id, "Room connection closed");
}

/// Apply one client verb. Returns `None` when the connection should
/// close. Server-side failures are logged, never surfaced to the sender.
fn handle_event(
    state: &AppState,
    connection_id: &ConnectionId,
    delivery_tx: &mpsc::Sender<Delivery>,
    event: ClientEvent,
) -> Option<()> {
    match event {
        ClientEvent::JoinRoom {
            room_id,
            username,
            avatar_url,
        } => {
            state.room.join(
                connection_id,
                delivery_tx.clone(),
                &RoomId::from(room_id),
                Identity::new(username, avatar_url),
            );
        }
        ClientEvent::SendMessage { room_id, message } => {
            if let Err(e) =
                state
                    .room
                    .send_message(connection_id, &RoomId::from(room_id), message)
            {
                warn!(connection_id = %connection_id, error = %e, "sendMessage rejected");
            }
        }
        ClientEvent::LeaveRoom { room_id } => {
            state.room.leave(connection_id, &RoomId::from(room_id));
        }
        ClientEvent::VideoControl {
            room_id,
            action,
            time,
        } => {
            if let Err(e) =
                state
                    .room
                    .video_control(connection_id, &RoomId::from(room_id), &action, time)
            {
                warn!(connection_id = %connection_id, error = %e, "videoControl rejected");
            }
        }
        ClientEvent::VideoUpdate {
            room_id,
            video_url,
            current_time,
            kind,
        } => {
            if let Err(e) = state.room.video_update(
                connection_id,
                &RoomId::from(room_id),
                video_url,
                current_time,
                kind,
            ) {
                warn!(connection_id = %connection_id, error = %e, "videoUpdate rejected");
            }
        }
        ClientEvent::Disconnect => return None,
    }

    Some(())
}
