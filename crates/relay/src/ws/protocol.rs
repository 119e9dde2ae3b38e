use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use tandem_common::protocol::ws::{ClientMessage, ServerEvent};

pub fn decode_message(raw: &str) -> Result<ClientMessage, serde_json::Error> {
    serde_json::from_str::<ClientMessage>(raw)
}

pub fn encode_event(event: &ServerEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

pub async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let encoded = encode_event(event).map_err(|_| ())?;
    socket.send(Message::Text(encoded.into())).await.map_err(|_| ())
}

/// Closes the socket with a policy-violation frame and no payload.
pub async fn send_rejection(socket: &mut WebSocket) {
    let frame = CloseFrame { code: close_code::POLICY, reason: Utf8Bytes::from_static("") };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
