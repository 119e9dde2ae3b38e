// WebSocket message types for the tandem-sync.v1 protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PresenceEntry, PresenceStatus, Selection, UpdateRecord, UserId, WorkspaceId};

pub const CURRENT_PROTOCOL_VERSION: &str = "tandem-sync.v1";

/// Frames sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection handshake. Must be the first frame on a socket.
    ///
    /// `token` and `workspace_id` are optional on the wire so that a missing
    /// value is observed as a rejected handshake rather than a decode error.
    Hello {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workspace_id: Option<WorkspaceId>,
        #[serde(default)]
        user_id: UserId,
        #[serde(default)]
        user_email: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
    },

    /// Submit a document change.
    SubmitUpdate { payload: serde_json::Value },

    CursorUpdate {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },

    SelectionUpdate { selection: Selection },

    /// Explicit status override (e.g. the tab went to the background).
    StatusUpdate { status: PresenceStatus },

    /// Ask for every retained update after `since_version`.
    RequestSync { since_version: u64 },
}

/// Frames sent by the relay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent directly to a session right after it joins.
    Participants { participants: Vec<PresenceEntry> },

    ParticipantJoined { user_id: UserId, presence: PresenceEntry, timestamp: DateTime<Utc> },

    ParticipantLeft { user_id: UserId, timestamp: DateTime<Utc> },

    DocumentUpdated { payload: serde_json::Value, user_id: UserId, version: u64 },

    /// Cursor, selection or status change of another participant.
    PresenceUpdated { user_id: UserId, presence: PresenceEntry },

    SyncResponse {
        current_version: u64,
        missing_updates: Vec<UpdateRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        full_state: Option<serde_json::Value>,
    },

    /// Success acknowledgement of `submit_update`, sent after the fan-out.
    UpdateAck { version: u64 },

    Error { code: String, message: String, retryable: bool },
}

impl ServerEvent {
    pub fn error(code: &str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Error { code: code.to_string(), message: message.into(), retryable }
    }

    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Participants { .. } => "participants",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::DocumentUpdated { .. } => "document_updated",
            Self::PresenceUpdated { .. } => "presence_updated",
            Self::SyncResponse { .. } => "sync_response",
            Self::UpdateAck { .. } => "update_ack",
            Self::Error { .. } => "error",
        }
    }
}
