//! Client-side view of who else is in the room and where their cursors are.
//!
//! ```text
//! local pointer move
//!       │  (rate-limited, default 50 ms)
//!       ▼
//! CursorFrame ──► relay ──► peers
//!
//! remote CursorFrame
//!       │
//!       ▼
//! cursor buffer (last writer wins per participant)
//!       │  drained on every render tick
//!       ▼
//! Surface::update_collaborators
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::participant::{Participant, ParticipantIdentity};
use crate::protocol::{CursorFrame, Pointer};
use crate::timing::RateLimiter;

/// Fill and stroke used to draw a collaborator's cursor.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollaboratorColor {
    pub background: String,
    pub stroke: String,
}

/// A remote cursor as the drawing surface consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub id: String,
    pub pointer: Pointer,
    pub button: String,
    pub selected_element_ids: HashMap<String, bool>,
    pub username: String,
    pub avatar_url: Option<String>,
    pub color: CollaboratorColor,
}

impl From<CursorFrame> for Collaborator {
    fn from(frame: CursorFrame) -> Self {
        let button = if frame.button.is_empty() {
            "up".to_string()
        } else {
            frame.button
        };
        Self {
            id: frame.participant_id,
            pointer: frame.pointer,
            button,
            selected_element_ids: frame.selection,
            username: frame.display_name,
            avatar_url: frame.avatar,
            color: CollaboratorColor {
                background: frame.color.clone(),
                stroke: frame.color,
            },
        }
    }
}

/// Presence state of one open document, as seen by the local user.
pub struct PresenceView {
    document_id: String,
    local: ParticipantIdentity,
    peers: Vec<Participant>,
    cursors: HashMap<String, Collaborator>,
    limiter: RateLimiter,
}

impl PresenceView {
    pub fn new(
        document_id: impl Into<String>,
        local: ParticipantIdentity,
        limiter: RateLimiter,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            local,
            peers: Vec::new(),
            cursors: HashMap::new(),
            limiter,
        }
    }

    /// Build an outbound cursor frame unless the rate limit swallows it.
    pub fn local_cursor(
        &mut self,
        pointer: Pointer,
        button: &str,
        selected: &HashSet<String>,
        now: Instant,
    ) -> Option<CursorFrame> {
        if !self.limiter.allow(now) {
            return None;
        }
        Some(CursorFrame {
            document_id: self.document_id.clone(),
            pointer,
            button: button.to_string(),
            selection: selected.iter().map(|id| (id.clone(), true)).collect(),
            participant_id: self.local.id.clone(),
            display_name: self.local.name.clone(),
            avatar: None,
            color: self.local.color.clone(),
        })
    }

    /// Buffer a remote cursor; only the latest frame per peer is kept.
    pub fn buffer_cursor(&mut self, frame: CursorFrame) {
        if frame.participant_id == self.local.id || frame.participant_id.is_empty() {
            return;
        }
        self.cursors
            .insert(frame.participant_id.clone(), Collaborator::from(frame));
    }

    /// Everything buffered since the last render tick.
    pub fn drain_cursors(&mut self) -> Vec<Collaborator> {
        self.cursors.drain().map(|(_, c)| c).collect()
    }

    /// Replace the peer list. Returns the ids of peers that are inactive,
    /// whose cursors should disappear.
    pub fn apply_presence(&mut self, participants: Vec<Participant>) -> Vec<String> {
        let local_id = self.local.id.clone();
        self.peers = participants
            .into_iter()
            .filter(|p| p.id != local_id)
            .collect();

        let inactive: Vec<String> = self
            .peers
            .iter()
            .filter(|p| !p.is_active)
            .map(|p| p.id.clone())
            .collect();
        for id in &inactive {
            self.cursors.remove(id);
        }
        inactive
    }

    pub fn peers(&self) -> &[Participant] {
        &self.peers
    }

    pub fn buffered(&self) -> usize {
        self.cursors.len()
    }
}
