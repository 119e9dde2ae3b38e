// Room membership and event fan-out, independent of the socket transport.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tandem_common::protocol::ws::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;

use super::session::ConnectionId;

pub type Outbound = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug)]
struct Member {
    workspace_id: String,
    user_id: String,
    outbound: Outbound,
}

#[derive(Debug, Default)]
struct Rooms {
    rooms: HashMap<String, HashSet<ConnectionId>>,
    members: HashMap<ConnectionId, Member>,
}

/// Connections grouped by workspace.
///
/// Sends only enqueue onto each connection's unbounded channel, so the lock
/// is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<RwLock<Rooms>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, workspace_id: &str, user_id: &str, connection: ConnectionId, outbound: Outbound) {
        let mut rooms = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = rooms.members.remove(&connection) {
            remove_from_room(&mut rooms.rooms, &previous.workspace_id, connection);
        }

        rooms.rooms.entry(workspace_id.to_string()).or_default().insert(connection);
        rooms.members.insert(
            connection,
            Member { workspace_id: workspace_id.to_string(), user_id: user_id.to_string(), outbound },
        );
    }

    /// Removes the connection; returns the workspace it belonged to.
    pub fn leave(&self, connection: ConnectionId) -> Option<String> {
        let mut rooms = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let member = rooms.members.remove(&connection)?;
        remove_from_room(&mut rooms.rooms, &member.workspace_id, connection);
        Some(member.workspace_id)
    }

    /// Whether any connection of `user_id` is still in the room.
    pub fn has_user(&self, workspace_id: &str, user_id: &str) -> bool {
        let rooms = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        rooms.rooms.get(workspace_id).is_some_and(|members| {
            members
                .iter()
                .filter_map(|connection| rooms.members.get(connection))
                .any(|member| member.user_id == user_id)
        })
    }

    pub fn members(&self, workspace_id: &str) -> Vec<ConnectionId> {
        let rooms = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut members: Vec<ConnectionId> =
            rooms.rooms.get(workspace_id).map(|set| set.iter().copied().collect()).unwrap_or_default();
        members.sort();
        members
    }

    pub fn room_size(&self, workspace_id: &str) -> usize {
        let rooms = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        rooms.rooms.get(workspace_id).map_or(0, HashSet::len)
    }

    pub fn room_count(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).rooms.len()
    }

    /// Sends directly to one connection.
    pub fn send_to(&self, connection: ConnectionId, event: ServerEvent) -> bool {
        let rooms = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        rooms.members.get(&connection).is_some_and(|member| member.outbound.send(event).is_ok())
    }

    /// Fans `event` out to every connection in the room except `exclude`.
    ///
    /// A closed recipient is skipped and the rest still receive the event.
    /// Returns the number of successful deliveries.
    pub fn broadcast(
        &self,
        workspace_id: &str,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let rooms = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(members) = rooms.rooms.get(workspace_id) else {
            return 0;
        };

        let mut delivered = 0;
        for connection in members {
            if Some(*connection) == exclude {
                continue;
            }
            let Some(member) = rooms.members.get(connection) else {
                continue;
            };
            if member.outbound.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                debug!(
                    workspace_id = %workspace_id,
                    connection_id = %connection,
                    event = event.kind(),
                    "dropping event for closed connection"
                );
            }
        }
        delivered
    }
}

fn remove_from_room(
    rooms: &mut HashMap<String, HashSet<ConnectionId>>,
    workspace_id: &str,
    connection: ConnectionId,
) {
    if let Some(members) = rooms.get_mut(workspace_id) {
        members.remove(&connection);
        if members.is_empty() {
            rooms.remove(workspace_id);
        }
    }
}
