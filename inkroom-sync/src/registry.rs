//! Per-room presence lists kept by the relay.
//!
//! The registry is plain owned state. The server guards it with a single
//! async mutex and rebroadcasts the returned lists while still holding the
//! lock, so a room never observes a stale presence list after a mutation.

use crate::participant::{ConnectionId, Participant, ParticipantIdentity};
use std::collections::HashMap;

/// A room's presence list after a mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomPresence {
    pub room_id: String,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Default)]
pub struct PresenceRegistry {
    rooms: HashMap<String, Vec<Participant>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a room.
    ///
    /// A previous entry for the same logical participant id is replaced, so a
    /// user reloading the page shows up once. Returns the full list.
    pub fn join(
        &mut self,
        room_id: &str,
        identity: ParticipantIdentity,
        connection: ConnectionId,
    ) -> Vec<Participant> {
        let participants = self.rooms.entry(room_id.to_string()).or_default();
        participants.retain(|p| p.id != identity.id);
        participants.push(Participant::new(identity, connection));
        participants.clone()
    }

    /// Flip the activity flag of a connection in every room it is in.
    pub fn set_activity(&mut self, connection: ConnectionId, is_active: bool) -> Vec<RoomPresence> {
        let mut changed = Vec::new();
        for (room_id, participants) in self.rooms.iter_mut() {
            let mut touched = false;
            for participant in participants.iter_mut() {
                if participant.connection_id == connection {
                    participant.is_active = is_active;
                    touched = true;
                }
            }
            if touched {
                changed.push(RoomPresence {
                    room_id: room_id.clone(),
                    participants: participants.clone(),
                });
            }
        }
        changed
    }

    /// Remove a connection from every room. Rooms left empty are dropped
    /// but still reported.
    pub fn disconnect(&mut self, connection: ConnectionId) -> Vec<RoomPresence> {
        let mut changed = Vec::new();
        self.rooms.retain(|room_id, participants| {
            let before = participants.len();
            participants.retain(|p| p.connection_id != connection);
            if participants.len() != before {
                changed.push(RoomPresence {
                    room_id: room_id.clone(),
                    participants: participants.clone(),
                });
            }
            !participants.is_empty()
        });
        changed
    }

    pub fn participants(&self, room_id: &str) -> &[Participant] {
        self.rooms.get(room_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}
