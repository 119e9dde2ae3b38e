// Core domain types shared between the relay and its clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque workspace identifier as carried on the wire.
pub type WorkspaceId = String;

/// Opaque participant identifier as carried on the wire.
pub type UserId = String;

/// Awareness status of a participant within a workspace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

impl PresenceStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Away => "away",
        }
    }

    /// Active and idle participants count as online; away does not.
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Active | Self::Idle)
    }
}

/// Pointer position inside the shared canvas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
    /// Node the cursor hovers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// Current selection of a participant.
///
/// Either a set of selected nodes, a text range inside a node, or both.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<SelectionRange>,
}

/// Text selection range (anchor, head) inside a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRange {
    pub anchor: u32,
    pub head: u32,
}

/// Ephemeral awareness state of one participant in one workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub email: String,
    pub display_name: String,
    /// Hex colour, stable for as long as the entry lives.
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_position: Option<CursorPosition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub status: PresenceStatus,
    pub last_activity: DateTime<Utc>,
}

/// One accepted change with its assigned version, author, and payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRecord {
    pub version: u64,
    pub user_id: UserId,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}
