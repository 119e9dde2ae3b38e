use std::fmt;

use uuid::Uuid;

pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const MAX_FRAME_BYTES: usize = 262_144;

/// Identifies one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Joined { workspace_id: String, user_id: String },
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("session already joined a workspace")]
    AlreadyJoined,
    #[error("session is disconnected")]
    Disconnected,
}

/// Binding of one connection to a workspace and user.
///
/// `Authenticating -> Joined -> Disconnected`; a rejected handshake goes
/// straight to `Disconnected`, which is terminal.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    id: ConnectionId,
    state: SessionState,
}

impl ConnectionSession {
    pub fn new(id: ConnectionId) -> Self {
        Self { id, state: SessionState::Authenticating }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// `(workspace_id, user_id)` while joined.
    pub fn joined(&self) -> Option<(&str, &str)> {
        match &self.state {
            SessionState::Joined { workspace_id, user_id } => {
                Some((workspace_id.as_str(), user_id.as_str()))
            }
            _ => None,
        }
    }

    pub fn join(&mut self, workspace_id: &str, user_id: &str) -> Result<(), TransitionError> {
        match self.state {
            SessionState::Authenticating => {
                self.state = SessionState::Joined {
                    workspace_id: workspace_id.to_string(),
                    user_id: user_id.to_string(),
                };
                Ok(())
            }
            SessionState::Joined { .. } => Err(TransitionError::AlreadyJoined),
            SessionState::Disconnected => Err(TransitionError::Disconnected),
        }
    }

    /// Moves to `Disconnected`, returning the binding that was active.
    pub fn close(&mut self) -> Option<(String, String)> {
        match std::mem::replace(&mut self.state, SessionState::Disconnected) {
            SessionState::Joined { workspace_id, user_id } => Some((workspace_id, user_id)),
            _ => None,
        }
    }
}
