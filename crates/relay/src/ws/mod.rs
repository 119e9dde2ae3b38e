pub mod protocol;
pub mod rooms;
pub mod router;
pub mod session;

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use tandem_common::protocol::ws::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
};
use protocol::{decode_message, send_event, send_rejection};
pub use rooms::RoomRegistry;
pub use router::{BroadcastRouter, Handshake};
use session::{
    ConnectionId, ConnectionSession, HANDSHAKE_TIMEOUT_MS, HEARTBEAT_INTERVAL_MS,
    HEARTBEAT_TIMEOUT_MS, MAX_FRAME_BYTES,
};

pub fn router(broadcast: BroadcastRouter) -> Router {
    Router::new().route("/v1/ws", get(ws_upgrade)).with_state(broadcast)
}

pub async fn ws_upgrade(
    State(broadcast): State<BroadcastRouter>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(MAX_FRAME_BYTES)
        .max_message_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(broadcast, socket)).await;
        })
}

async fn handle_socket(broadcast: BroadcastRouter, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let mut session = ConnectionSession::new(ConnectionId::new());
    let connection_id = session.id();

    let first_frame =
        tokio::time::timeout(Duration::from_millis(HANDSHAKE_TIMEOUT_MS), socket.recv()).await;
    let handshake = match first_frame {
        Ok(Some(Ok(Message::Text(raw)))) => {
            decode_message(&raw).ok().and_then(Handshake::from_message)
        }
        _ => None,
    };
    let Some(handshake) = handshake else {
        debug!(connection_id = %connection_id, request_id = %request_id, "first frame was not a hello");
        session.close();
        send_rejection(&mut socket).await;
        return;
    };

    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<ServerEvent>();
    if let Err(error) = broadcast.join(&mut session, handshake, outbound_sender).await {
        warn!(
            connection_id = %connection_id,
            request_id = %request_id,
            error = %error,
            "handshake rejected"
        );
        send_rejection(&mut socket).await;
        return;
    }

    // Heartbeat: server pings every HEARTBEAT_INTERVAL_MS, disconnects if no
    // pong arrives within HEARTBEAT_TIMEOUT_MS.
    let mut heartbeat_interval = tokio::time::interval(Duration::from_millis(HEARTBEAT_INTERVAL_MS));
    heartbeat_interval.reset();
    let mut last_pong = Instant::now();
    let heartbeat_timeout = Duration::from_millis(HEARTBEAT_INTERVAL_MS + HEARTBEAT_TIMEOUT_MS);

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_timeout {
                    warn!(connection_id = %connection_id, request_id = %request_id, "heartbeat timeout, disconnecting");
                    break;
                }
                if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound_receiver.recv() => {
                let Some(event) = maybe_outbound else {
                    break;
                };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(Ok(message)) = maybe_message else {
                    break;
                };

                match message {
                    Message::Text(raw) => {
                        let replies = match decode_message(&raw) {
                            Ok(inbound) => broadcast.handle_message(&session, inbound).await,
                            Err(_) => vec![ServerEvent::error(
                                ErrorCode::InvalidMessage.as_str(),
                                ErrorCode::InvalidMessage.default_message(),
                                false,
                            )],
                        };

                        let mut send_failed = false;
                        for reply in &replies {
                            if send_event(&mut socket, reply).await.is_err() {
                                send_failed = true;
                                break;
                            }
                        }
                        if send_failed {
                            break;
                        }
                    }
                    Message::Binary(_) => {
                        let error = ServerEvent::error(
                            ErrorCode::InvalidMessage.as_str(),
                            "binary frames are not supported",
                            false,
                        );
                        if send_event(&mut socket, &error).await.is_err() {
                            break;
                        }
                    }
                    Message::Ping(payload) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {
                        last_pong = Instant::now();
                    }
                    Message::Close(_) => break,
                }
            }
        }
    }

    broadcast.disconnect(&mut session).await;
    info!(connection_id = %connection_id, request_id = %request_id, "connection closed");
}
