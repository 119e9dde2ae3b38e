// Session lifecycle and event routing between connections, documents and
// presence.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tandem_common::protocol::ws::{ClientMessage, ServerEvent};
use tandem_common::types::{CursorPosition, PresenceEntry};
use tracing::{debug, info, info_span, warn, Instrument};

use super::rooms::{Outbound, RoomRegistry};
use super::session::ConnectionSession;
use crate::auth::IdentityVerifier;
use crate::error::{AuthError, ErrorCode};
use crate::presence::{ExpiryNotifier, PresenceRegistry};
use crate::sync::DocumentStore;

/// Credentials and identity fields of a `hello` frame.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub token: Option<String>,
    pub workspace_id: Option<String>,
    pub user_id: String,
    pub user_email: String,
    pub user_name: Option<String>,
}

impl Handshake {
    /// Extracts the handshake from a `hello` frame; any other frame is `None`.
    pub fn from_message(message: ClientMessage) -> Option<Self> {
        match message {
            ClientMessage::Hello { token, workspace_id, user_id, user_email, user_name } => {
                Some(Self { token, workspace_id, user_id, user_email, user_name })
            }
            _ => None,
        }
    }
}

/// Ties connection sessions to the document store, the presence registry
/// and the room fan-out.
#[derive(Clone)]
pub struct BroadcastRouter {
    documents: Arc<DocumentStore>,
    presence: PresenceRegistry,
    rooms: RoomRegistry,
    verifier: Arc<dyn IdentityVerifier>,
}

impl BroadcastRouter {
    pub fn new(
        documents: Arc<DocumentStore>,
        presence: PresenceRegistry,
        rooms: RoomRegistry,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self { documents, presence, rooms, verifier }
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    /// Authenticates the handshake and enters `Joined`.
    ///
    /// On success the session receives the participant list on `outbound`
    /// and every other room member gets `participant_joined`. On failure the
    /// session is `Disconnected` and nothing is registered or broadcast.
    ///
    /// The session enters the room before the list is taken, so a concurrent
    /// joiner is either in the list or announced afterwards. Room events
    /// fanned out in between may reach the session ahead of the list.
    pub async fn join(
        &self,
        session: &mut ConnectionSession,
        handshake: Handshake,
        outbound: Outbound,
    ) -> Result<PresenceEntry, AuthError> {
        let identity = match self.authenticate(&handshake) {
            Ok(identity) => identity,
            Err(error) => {
                session.close();
                return Err(error);
            }
        };
        let workspace_id = identity.workspace_id;
        let user_id = identity.user_id;

        if session.join(&workspace_id, &user_id).is_err() {
            return Err(AuthError::InvalidToken);
        }

        async {
            let presence = self
                .presence
                .join(&workspace_id, &user_id, &handshake.user_email, handshake.user_name.as_deref())
                .await;

            self.rooms.join(&workspace_id, &user_id, session.id(), outbound);
            let participants = self.presence.list_all(&workspace_id).await;
            self.rooms.send_to(session.id(), ServerEvent::Participants { participants });

            let notified = self.rooms.broadcast(
                &workspace_id,
                &ServerEvent::ParticipantJoined {
                    user_id: user_id.clone(),
                    presence: presence.clone(),
                    timestamp: Utc::now(),
                },
                Some(session.id()),
            );
            info!(notified, "session joined");

            Ok(presence)
        }
        .instrument(info_span!(
            "relay.ws.join",
            workspace_id = %workspace_id,
            user_id = %user_id,
            connection_id = %session.id()
        ))
        .await
    }

    fn authenticate(&self, handshake: &Handshake) -> Result<crate::auth::VerifiedIdentity, AuthError> {
        let token = handshake.token.as_deref().unwrap_or_default();
        let workspace_id = handshake.workspace_id.as_deref().unwrap_or_default();
        let identity = self.verifier.verify(token, workspace_id)?;

        let claimed = handshake.user_id.trim();
        if !claimed.is_empty() && claimed != identity.user_id {
            return Err(AuthError::InvalidToken);
        }
        Ok(identity)
    }

    /// Handles one frame from a joined session and returns the frames to
    /// send back to that session only.
    pub async fn handle_message(
        &self,
        session: &ConnectionSession,
        message: ClientMessage,
    ) -> Vec<ServerEvent> {
        match message {
            ClientMessage::Hello { .. } => {
                vec![reject(ErrorCode::InvalidMessage, "session already completed its handshake")]
            }
            ClientMessage::SubmitUpdate { payload } => vec![self.submit_update(session, payload).await],
            ClientMessage::CursorUpdate { x, y, node_id } => {
                self.update_cursor(session, CursorPosition { x, y, node_id }).await
            }
            ClientMessage::SelectionUpdate { selection } => {
                let Some((workspace_id, user_id)) = session.joined() else {
                    return vec![not_joined()];
                };
                let entry = self.presence.update_selection(workspace_id, user_id, selection).await;
                self.fan_out_presence(session, entry);
                Vec::new()
            }
            ClientMessage::StatusUpdate { status } => {
                let Some((workspace_id, user_id)) = session.joined() else {
                    return vec![not_joined()];
                };
                let entry = self.presence.update_status(workspace_id, user_id, status).await;
                self.fan_out_presence(session, entry);
                Vec::new()
            }
            ClientMessage::RequestSync { since_version } => {
                vec![self.request_sync(session, since_version).await]
            }
        }
    }

    /// Applies the update, fans it out to the rest of the room, then
    /// acknowledges. A failure is reported to the sender only.
    ///
    /// The fan-out is enqueued while the workspace is still locked, so every
    /// member sees `document_updated` in version order.
    pub async fn submit_update(&self, session: &ConnectionSession, payload: Value) -> ServerEvent {
        let Some((workspace_id, user_id)) = session.joined() else {
            return not_joined();
        };

        let applied = self
            .documents
            .apply_update_with(workspace_id, payload.clone(), user_id, |document| {
                self.rooms.broadcast(
                    workspace_id,
                    &ServerEvent::DocumentUpdated {
                        payload,
                        user_id: user_id.to_string(),
                        version: document.version,
                    },
                    Some(session.id()),
                )
            })
            .await;
        let (document, delivered) = match applied {
            Ok(applied) => applied,
            Err(error) => {
                warn!(workspace_id = %workspace_id, user_id = %user_id, error = %error, "update rejected");
                return reject(error.code(), error.to_string());
            }
        };
        debug!(workspace_id = %workspace_id, version = document.version, delivered, "update fanned out");

        let woken = self.presence.record_activity(workspace_id, user_id).await;
        self.fan_out_presence(session, woken);

        ServerEvent::UpdateAck { version: document.version }
    }

    pub async fn request_sync(&self, session: &ConnectionSession, since_version: u64) -> ServerEvent {
        let Some((workspace_id, _)) = session.joined() else {
            return not_joined();
        };

        match self.documents.sync_plan(workspace_id, since_version).await {
            Ok(plan) => ServerEvent::SyncResponse {
                current_version: plan.current_version,
                missing_updates: plan.missing_updates,
                full_state: plan.full_state,
            },
            Err(error) => reject(error.code(), error.to_string()),
        }
    }

    async fn update_cursor(&self, session: &ConnectionSession, cursor: CursorPosition) -> Vec<ServerEvent> {
        let Some((workspace_id, user_id)) = session.joined() else {
            return vec![not_joined()];
        };
        let entry = self.presence.update_cursor(workspace_id, user_id, cursor).await;
        self.fan_out_presence(session, entry);
        Vec::new()
    }

    fn fan_out_presence(&self, session: &ConnectionSession, entry: Option<PresenceEntry>) {
        let Some((workspace_id, user_id)) = session.joined() else {
            return;
        };
        let Some(presence) = entry else {
            debug!(workspace_id = %workspace_id, user_id = %user_id, "presence update for absent participant");
            return;
        };

        self.rooms.broadcast(
            workspace_id,
            &ServerEvent::PresenceUpdated { user_id: user_id.to_string(), presence },
            Some(session.id()),
        );
    }

    /// Leaves the room and, once the user has no other connection there,
    /// the presence registry, telling the remaining members.
    pub async fn disconnect(&self, session: &mut ConnectionSession) {
        self.rooms.leave(session.id());
        let Some((workspace_id, user_id)) = session.close() else {
            return;
        };

        if self.rooms.has_user(&workspace_id, &user_id) {
            debug!(workspace_id = %workspace_id, user_id = %user_id, "user still connected elsewhere");
            return;
        }

        self.presence.leave(&workspace_id, &user_id).await;
        self.rooms.broadcast(
            &workspace_id,
            &ServerEvent::ParticipantLeft { user_id: user_id.clone(), timestamp: Utc::now() },
            None,
        );
        info!(workspace_id = %workspace_id, user_id = %user_id, connection_id = %session.id(), "session left");
    }
}

impl ExpiryNotifier for BroadcastRouter {
    fn is_connected(&self, workspace_id: &str, user_id: &str) -> bool {
        self.rooms.has_user(workspace_id, user_id)
    }

    fn participant_expired(&self, workspace_id: &str, user_id: &str) {
        self.rooms.broadcast(
            workspace_id,
            &ServerEvent::ParticipantLeft { user_id: user_id.to_string(), timestamp: Utc::now() },
            None,
        );
    }
}

fn reject(code: ErrorCode, message: impl Into<String>) -> ServerEvent {
    ServerEvent::error(code.as_str(), message, code.retryable())
}

fn not_joined() -> ServerEvent {
    reject(ErrorCode::SessionNotJoined, ErrorCode::SessionNotJoined.default_message())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::JwtIdentityVerifier;
    use crate::presence::PresenceSweeper;
    use crate::ws::session::{ConnectionId, SessionState};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;
    use tandem_common::types::{PresenceStatus, Selection};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const TEST_SECRET: &str = "tandem_test_secret_that_is_definitely_long_enough";

    struct Harness {
        router: BroadcastRouter,
        verifier: Arc<JwtIdentityVerifier>,
        documents: Arc<DocumentStore>,
        presence: PresenceRegistry,
    }

    fn harness() -> Harness {
        let verifier =
            Arc::new(JwtIdentityVerifier::new(TEST_SECRET).expect("verifier should initialize"));
        let documents = Arc::new(DocumentStore::default());
        let presence = PresenceRegistry::new();
        let router = BroadcastRouter::new(
            documents.clone(),
            presence.clone(),
            RoomRegistry::new(),
            verifier.clone(),
        );
        Harness { router, verifier, documents, presence }
    }

    impl Harness {
        fn hello(&self, workspace_id: &str, user_id: &str) -> Handshake {
            Handshake {
                token: Some(
                    self.verifier.issue_workspace_token(user_id, workspace_id).expect("token"),
                ),
                workspace_id: Some(workspace_id.to_string()),
                user_id: user_id.to_string(),
                user_email: format!("{user_id}@x.com"),
                user_name: None,
            }
        }

        async fn connect(
            &self,
            workspace_id: &str,
            user_id: &str,
        ) -> (ConnectionSession, UnboundedReceiver<ServerEvent>) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let mut session = ConnectionSession::new(ConnectionId::new());
            self.router
                .join(&mut session, self.hello(workspace_id, user_id), sender)
                .await
                .expect("join should succeed");
            (session, receiver)
        }
    }

    fn drain(receiver: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn join_sends_participants_to_self_and_joined_to_others() {
        let h = harness();
        let (_first, mut first_rx) = h.connect("w1", "u1").await;
        drain(&mut first_rx);

        let (_second, mut second_rx) = h.connect("w1", "u2").await;

        let to_second = drain(&mut second_rx);
        assert_eq!(to_second.len(), 1);
        let ServerEvent::Participants { participants } = &to_second[0] else {
            panic!("expected participants, got {to_second:?}");
        };
        assert_eq!(participants.len(), 2);
        assert_ne!(participants[0].color, participants[1].color);
        assert!(participants.iter().all(|entry| entry.status == PresenceStatus::Active));

        let to_first = drain(&mut first_rx);
        assert!(matches!(
            to_first.as_slice(),
            [ServerEvent::ParticipantJoined { user_id, .. }] if user_id == "u2"
        ));
    }

    #[tokio::test]
    async fn empty_workspace_id_is_rejected_without_side_effects() {
        let h = harness();
        let (_observer, mut observer_rx) = h.connect("w1", "u1").await;
        drain(&mut observer_rx);

        let mut hello = h.hello("w1", "u2");
        hello.workspace_id = Some(String::new());
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let mut session = ConnectionSession::new(ConnectionId::new());

        let result = h.router.join(&mut session, hello, sender).await;

        assert_eq!(result, Err(AuthError::MissingWorkspace));
        assert_eq!(session.state(), &SessionState::Disconnected);
        assert!(h.presence.get("w1", "u2").await.is_none());
        assert!(h.presence.get("", "u2").await.is_none());
        assert_eq!(h.router.rooms().room_size("w1"), 1);
        assert!(drain(&mut receiver).is_empty());
        assert!(drain(&mut observer_rx).is_empty());
    }

    #[tokio::test]
    async fn missing_or_foreign_tokens_are_rejected() {
        let h = harness();

        let mut no_token = h.hello("w1", "u1");
        no_token.token = None;
        let mut session = ConnectionSession::new(ConnectionId::new());
        let (sender, _rx) = mpsc::unbounded_channel();
        assert_eq!(h.router.join(&mut session, no_token, sender).await, Err(AuthError::MissingToken));

        let mut other_workspace = h.hello("w2", "u1");
        other_workspace.workspace_id = Some("w1".into());
        let mut session = ConnectionSession::new(ConnectionId::new());
        let (sender, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            h.router.join(&mut session, other_workspace, sender).await,
            Err(AuthError::Forbidden { workspace_id: "w1".into() })
        );

        let mut impersonation = h.hello("w1", "u1");
        impersonation.user_id = "someone-else".into();
        let mut session = ConnectionSession::new(ConnectionId::new());
        let (sender, _rx) = mpsc::unbounded_channel();
        assert_eq!(
            h.router.join(&mut session, impersonation, sender).await,
            Err(AuthError::InvalidToken)
        );

        assert_eq!(h.presence.workspace_count().await, 0);
    }

    #[tokio::test]
    async fn update_is_broadcast_to_others_then_acked() {
        let h = harness();
        let (sender, mut sender_rx) = h.connect("w1", "u1").await;
        let (_peer, mut peer_rx) = h.connect("w1", "u2").await;
        drain(&mut sender_rx);
        drain(&mut peer_rx);

        let replies = h
            .router
            .handle_message(&sender, ClientMessage::SubmitUpdate { payload: json!({ "t": "a" }) })
            .await;

        assert_eq!(replies, vec![ServerEvent::UpdateAck { version: 1 }]);
        assert_eq!(
            drain(&mut peer_rx),
            vec![ServerEvent::DocumentUpdated {
                payload: json!({ "t": "a" }),
                user_id: "u1".into(),
                version: 1,
            }]
        );
        assert!(drain(&mut sender_rx).is_empty());
        assert_eq!(h.documents.head_version("w1").await, Some(1));
    }

    #[tokio::test]
    async fn frames_before_join_get_not_joined_errors() {
        let h = harness();
        let session = ConnectionSession::new(ConnectionId::new());

        let replies = h
            .router
            .handle_message(&session, ClientMessage::SubmitUpdate { payload: json!({}) })
            .await;

        assert!(matches!(
            replies.as_slice(),
            [ServerEvent::Error { code, retryable: false, .. }] if code == "SYNC_SESSION_NOT_JOINED"
        ));
        assert!(h.documents.workspace_ids().await.is_empty());
    }

    #[tokio::test]
    async fn cursor_update_reaches_peers_and_registry() {
        let h = harness();
        let (mover, mut mover_rx) = h.connect("w1", "u1").await;
        let (_peer, mut peer_rx) = h.connect("w1", "u2").await;
        drain(&mut mover_rx);
        drain(&mut peer_rx);

        let replies = h
            .router
            .handle_message(&mover, ClientMessage::CursorUpdate { x: 10.0, y: 20.0, node_id: None })
            .await;
        assert!(replies.is_empty());

        let entry = h.presence.get("w1", "u1").await.expect("presence");
        assert_eq!(entry.cursor_position, Some(CursorPosition { x: 10.0, y: 20.0, node_id: None }));
        assert_eq!(entry.status, PresenceStatus::Active);

        assert!(matches!(
            drain(&mut peer_rx).as_slice(),
            [ServerEvent::PresenceUpdated { user_id, .. }] if user_id == "u1"
        ));
        assert!(drain(&mut mover_rx).is_empty());
    }

    #[tokio::test]
    async fn request_sync_returns_missing_updates() {
        let h = harness();
        let (session, _rx) = h.connect("w1", "u1").await;
        h.router.submit_update(&session, json!({ "n": 1 })).await;
        h.router.submit_update(&session, json!({ "n": 2 })).await;

        let reply = h.router.request_sync(&session, 1).await;
        let ServerEvent::SyncResponse { current_version, missing_updates, full_state } = reply else {
            panic!("expected sync response");
        };
        assert_eq!(current_version, 2);
        assert_eq!(missing_updates.len(), 1);
        assert_eq!(missing_updates[0].version, 2);
        assert!(full_state.is_none());

        let ServerEvent::SyncResponse { full_state, .. } = h.router.request_sync(&session, 0).await
        else {
            panic!("expected sync response");
        };
        assert_eq!(full_state, Some(json!({ "n": 2 })));
    }

    #[tokio::test]
    async fn disconnect_leaves_presence_and_notifies_room() {
        let h = harness();
        let (mut leaving, _leaving_rx) = h.connect("w1", "u1").await;
        let (_stay, mut stay_rx) = h.connect("w1", "u2").await;
        drain(&mut stay_rx);

        h.router.disconnect(&mut leaving).await;

        assert!(h.presence.get("w1", "u1").await.is_none());
        assert_eq!(h.router.rooms().room_size("w1"), 1);
        assert!(matches!(
            drain(&mut stay_rx).as_slice(),
            [ServerEvent::ParticipantLeft { user_id, .. }] if user_id == "u1"
        ));
    }

    #[tokio::test]
    async fn second_tab_keeps_presence_alive() {
        let h = harness();
        let (mut first_tab, _first_rx) = h.connect("w1", "u1").await;
        let (_second_tab, _second_rx) = h.connect("w1", "u1").await;

        h.router.disconnect(&mut first_tab).await;

        assert!(h.presence.get("w1", "u1").await.is_some());
        assert_eq!(h.presence.count("w1").await, 1);
    }

    #[tokio::test]
    async fn expired_participants_are_announced() {
        let h = harness();
        let (_session, mut rx) = h.connect("w1", "u1").await;
        drain(&mut rx);

        h.router.participant_expired("w1", "u9");

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [ServerEvent::ParticipantLeft { user_id, .. }] if user_id == "u9"
        ));
    }

    #[tokio::test]
    async fn selection_and_status_updates_reach_peers() {
        let h = harness();
        let (actor, mut actor_rx) = h.connect("w1", "u1").await;
        let (_peer, mut peer_rx) = h.connect("w1", "u2").await;
        drain(&mut actor_rx);
        drain(&mut peer_rx);

        let selection = Selection { node_ids: vec!["n1".to_string()], range: None };
        let replies = h
            .router
            .handle_message(&actor, ClientMessage::SelectionUpdate { selection: selection.clone() })
            .await;
        assert!(replies.is_empty());
        match drain(&mut peer_rx).as_slice() {
            [ServerEvent::PresenceUpdated { user_id, presence }] => {
                assert_eq!(user_id, "u1");
                assert_eq!(presence.selection, Some(selection));
            }
            other => panic!("expected one presence_updated, got {other:?}"),
        }

        let replies = h
            .router
            .handle_message(&actor, ClientMessage::StatusUpdate { status: PresenceStatus::Away })
            .await;
        assert!(replies.is_empty());
        match drain(&mut peer_rx).as_slice() {
            [ServerEvent::PresenceUpdated { user_id, presence }] => {
                assert_eq!(user_id, "u1");
                assert_eq!(presence.status, PresenceStatus::Away);
            }
            other => panic!("expected one presence_updated, got {other:?}"),
        }
        assert_eq!(h.presence.get("w1", "u1").await.map(|e| e.status), Some(PresenceStatus::Away));
        assert!(drain(&mut actor_rx).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_reach_every_member_in_version_order() {
        let h = harness();
        let (_observer, mut observer_rx) = h.connect("w1", "observer").await;

        let mut writers = Vec::new();
        let mut writer_rxs = Vec::new();
        for index in 0..8 {
            let (session, rx) = h.connect("w1", &format!("writer{index}")).await;
            writers.push(session);
            writer_rxs.push(rx);
        }

        let mut handles = Vec::new();
        for session in writers {
            let router = h.router.clone();
            handles.push(tokio::spawn(async move {
                for round in 0..100 {
                    router.submit_update(&session, json!({ "round": round })).await;
                }
            }));
        }
        for handle in handles {
            handle.await.expect("writer task");
        }

        let versions = |rx: &mut UnboundedReceiver<ServerEvent>| -> Vec<u64> {
            drain(rx)
                .into_iter()
                .filter_map(|event| match event {
                    ServerEvent::DocumentUpdated { version, .. } => Some(version),
                    _ => None,
                })
                .collect()
        };

        let seen = versions(&mut observer_rx);
        assert_eq!(seen, (1..=800).collect::<Vec<u64>>());
        for rx in &mut writer_rxs {
            let seen = versions(rx);
            assert_eq!(seen.len(), 700);
            assert!(seen.windows(2).all(|pair| pair[0] < pair[1]), "out of order: {seen:?}");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_joiners_all_learn_about_each_other() {
        let h = harness();
        let users: BTreeSet<String> = (0..12).map(|index| format!("u{index}")).collect();

        let mut handles = Vec::new();
        for user_id in users.clone() {
            let router = h.router.clone();
            let verifier = h.verifier.clone();
            handles.push(tokio::spawn(async move {
                let (sender, receiver) = mpsc::unbounded_channel();
                let mut session = ConnectionSession::new(ConnectionId::new());
                let hello = Handshake {
                    token: Some(verifier.issue_workspace_token(&user_id, "w1").expect("token")),
                    workspace_id: Some("w1".to_string()),
                    user_id: user_id.clone(),
                    user_email: format!("{user_id}@x.com"),
                    user_name: None,
                };
                router.join(&mut session, hello, sender).await.expect("join should succeed");
                (session, receiver)
            }));
        }

        let mut joined = Vec::new();
        for handle in handles {
            joined.push(handle.await.expect("join task"));
        }

        for (_session, receiver) in &mut joined {
            let mut known = BTreeSet::new();
            for event in drain(receiver) {
                match event {
                    ServerEvent::Participants { participants } => {
                        known.extend(participants.into_iter().map(|entry| entry.user_id));
                    }
                    ServerEvent::ParticipantJoined { user_id, .. } => {
                        known.insert(user_id);
                    }
                    other => panic!("unexpected event {other:?}"),
                }
            }
            assert_eq!(known, users);
        }
    }

    #[tokio::test]
    async fn connected_editor_is_idled_but_never_expired() {
        let h = harness();
        let (editor, mut editor_rx) = h.connect("w1", "u1").await;
        let (_peer, mut peer_rx) = h.connect("w1", "u2").await;
        drain(&mut editor_rx);
        drain(&mut peer_rx);

        let sweeper = PresenceSweeper::new(
            h.presence.clone(),
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(60),
        );
        let report = sweeper.sweep_once(&h.router).await;
        assert!(report.expired.is_empty());
        assert_eq!(report.idled.len(), 2);
        assert!(drain(&mut peer_rx).is_empty());

        let ack = h.router.submit_update(&editor, json!({ "t": "still here" })).await;
        assert_eq!(ack, ServerEvent::UpdateAck { version: 1 });
        match drain(&mut peer_rx).as_slice() {
            [ServerEvent::DocumentUpdated { version: 1, .. }, ServerEvent::PresenceUpdated { user_id, presence }] => {
                assert_eq!(user_id, "u1");
                assert_eq!(presence.status, PresenceStatus::Active);
            }
            other => panic!("expected update then presence, got {other:?}"),
        }

        let replies = h
            .router
            .handle_message(&editor, ClientMessage::CursorUpdate { x: 1.0, y: 1.0, node_id: None })
            .await;
        assert!(replies.is_empty());
        assert!(matches!(
            drain(&mut peer_rx).as_slice(),
            [ServerEvent::PresenceUpdated { user_id, .. }] if user_id == "u1"
        ));
        assert!(h.router.is_connected("w1", "u1"));
        assert!(!h.router.is_connected("w1", "u9"));
    }
}
