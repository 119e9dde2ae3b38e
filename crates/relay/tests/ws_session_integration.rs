use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tandem_common::protocol::ws::{ClientMessage, ServerEvent};
use tandem_relay::{
    auth::{IdentityVerifier, JwtIdentityVerifier},
    build_router,
    config::RelayConfig,
    services::RelayServices,
    sync::persistence::MemoryWorkspaceStore,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::frame::coding::CloseCode, tungstenite::Message,
    MaybeTlsStream, WebSocketStream,
};

const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    addr: SocketAddr,
    verifier: JwtIdentityVerifier,
    services: RelayServices,
}

async fn start_relay() -> TestRelay {
    let verifier = JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize");
    let shared: Arc<dyn IdentityVerifier> = Arc::new(verifier.clone());
    let services =
        RelayServices::assemble(RelayConfig::default(), Arc::new(MemoryWorkspaceStore::new()), shared);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    let app = build_router(&services);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("relay should serve");
    });

    TestRelay { addr, verifier, services }
}

impl TestRelay {
    async fn connect(&self) -> Client {
        let (socket, _) = connect_async(format!("ws://{}/v1/ws", self.addr))
            .await
            .expect("websocket should connect");
        socket
    }

    fn hello(&self, user_id: &str, token_workspace: &str, workspace_id: &str) -> ClientMessage {
        ClientMessage::Hello {
            token: Some(
                self.verifier.issue_workspace_token(user_id, token_workspace).expect("token"),
            ),
            workspace_id: Some(workspace_id.to_string()),
            user_id: user_id.to_string(),
            user_email: format!("{user_id}@example.com"),
            user_name: None,
        }
    }

    /// Connects, sends hello and consumes the `participants` reply.
    async fn join(&self, user_id: &str, workspace_id: &str) -> (Client, Vec<String>) {
        let mut client = self.connect().await;
        send(&mut client, &self.hello(user_id, workspace_id, workspace_id)).await;
        match next_event(&mut client).await {
            ServerEvent::Participants { participants } => {
                let users = participants.into_iter().map(|entry| entry.user_id).collect();
                (client, users)
            }
            other => panic!("expected participants, got {other:?}"),
        }
    }
}

async fn send(client: &mut Client, message: &ClientMessage) {
    let encoded = serde_json::to_string(message).expect("message should encode");
    client.send(Message::text(encoded)).await.expect("frame should send");
}

async fn next_frame(client: &mut Client) -> Option<Message> {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("frame should arrive before the timeout");
        match frame {
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(message)) => return Some(message),
            Some(Err(_)) | None => return None,
        }
    }
}

async fn next_event(client: &mut Client) -> ServerEvent {
    match next_frame(client).await {
        Some(Message::Text(raw)) => serde_json::from_str(&raw).expect("event should decode"),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn join_announces_participants_to_both_sides() {
    let relay = start_relay().await;

    let (mut alice, first) = relay.join("alice", "w1").await;
    assert_eq!(first, vec!["alice".to_string()]);

    let (_bob, second) = relay.join("bob", "w1").await;
    assert_eq!(second, vec!["alice".to_string(), "bob".to_string()]);

    match next_event(&mut alice).await {
        ServerEvent::ParticipantJoined { user_id, presence, .. } => {
            assert_eq!(user_id, "bob");
            assert_eq!(presence.display_name, "bob");
        }
        other => panic!("expected participant_joined, got {other:?}"),
    }
}

#[tokio::test]
async fn submitted_update_reaches_peer_and_sender_gets_ack() {
    let relay = start_relay().await;
    let (mut alice, _) = relay.join("alice", "w1").await;
    let (mut bob, _) = relay.join("bob", "w1").await;
    let _joined = next_event(&mut alice).await;

    send(&mut bob, &ClientMessage::SubmitUpdate { payload: json!({ "title": "draft" }) }).await;

    assert_eq!(next_event(&mut bob).await, ServerEvent::UpdateAck { version: 1 });
    assert_eq!(
        next_event(&mut alice).await,
        ServerEvent::DocumentUpdated {
            payload: json!({ "title": "draft" }),
            user_id: "bob".to_string(),
            version: 1,
        }
    );
    assert_eq!(relay.services.documents.head_version("w1").await, Some(1));
}

#[tokio::test]
async fn request_sync_returns_missing_updates() {
    let relay = start_relay().await;
    let (mut alice, _) = relay.join("alice", "w1").await;

    for n in 1..=3 {
        send(&mut alice, &ClientMessage::SubmitUpdate { payload: json!({ "n": n }) }).await;
        assert_eq!(next_event(&mut alice).await, ServerEvent::UpdateAck { version: n });
    }

    send(&mut alice, &ClientMessage::RequestSync { since_version: 1 }).await;
    match next_event(&mut alice).await {
        ServerEvent::SyncResponse { current_version, missing_updates, full_state } => {
            assert_eq!(current_version, 3);
            let versions: Vec<u64> = missing_updates.iter().map(|update| update.version).collect();
            assert_eq!(versions, vec![2, 3]);
            assert!(full_state.is_none());
        }
        other => panic!("expected sync_response, got {other:?}"),
    }
}

#[tokio::test]
async fn closing_socket_broadcasts_participant_left() {
    let relay = start_relay().await;
    let (mut alice, _) = relay.join("alice", "w1").await;
    let (mut bob, _) = relay.join("bob", "w1").await;
    let _joined = next_event(&mut alice).await;

    bob.close(None).await.expect("close should send");

    match next_event(&mut alice).await {
        ServerEvent::ParticipantLeft { user_id, .. } => assert_eq!(user_id, "bob"),
        other => panic!("expected participant_left, got {other:?}"),
    }
    assert!(relay.services.presence.get("w1", "bob").await.is_none());
}

#[tokio::test]
async fn token_for_other_workspace_gets_policy_close_only() {
    let relay = start_relay().await;
    let (mut alice, _) = relay.join("alice", "w1").await;

    let mut intruder = relay.connect().await;
    send(&mut intruder, &relay.hello("mallory", "w2", "w1")).await;

    match next_frame(&mut intruder).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(frame.code, CloseCode::Policy);
            assert!(frame.reason.is_empty());
        }
        other => panic!("expected a policy close frame, got {other:?}"),
    }

    // Nothing was announced to the room.
    send(&mut alice, &ClientMessage::RequestSync { since_version: 0 }).await;
    assert!(matches!(next_event(&mut alice).await, ServerEvent::SyncResponse { .. }));
    assert!(relay.services.presence.get("w1", "mallory").await.is_none());
}

#[tokio::test]
async fn non_hello_first_frame_is_closed() {
    let relay = start_relay().await;
    let mut client = relay.connect().await;

    send(&mut client, &ClientMessage::RequestSync { since_version: 0 }).await;

    match next_frame(&mut client).await {
        Some(Message::Close(Some(frame))) => assert_eq!(frame.code, CloseCode::Policy),
        other => panic!("expected a policy close frame, got {other:?}"),
    }
}
