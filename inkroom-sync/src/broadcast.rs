//! Room-scoped fan-out with per-member queues.
//!
//! Every member connection owns two isolated outbound queues:
//!
//! ```text
//!                     ┌──────────────────────┐
//!  element-update ──► │ reliable (bounded)   │ ──► socket writer
//!  presence-update ─► │ full → evict member  │       (preferred)
//!                     ├──────────────────────┤
//!  cursor-move ─────► │ volatile (bounded)   │ ──► socket writer
//!     try_send        │ full → drop + count  │
//!                     └──────────────────────┘
//! ```
//!
//! A frame is encoded once per broadcast and shared by reference. Queues
//! are per member, so a slow consumer only ever fills its own queues and
//! never delays delivery to anyone else. The reliable queue has a high-water
//! mark: a member that lets it fill up is evicted (its socket task is told
//! to close) rather than having reliable frames silently skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::participant::ConnectionId;
use crate::protocol::{DeliveryClass, ProtocolError, ServerEvent};

/// A pre-encoded JSON envelope, shared across all recipients.
pub type Frame = Arc<str>;

/// Reliable frames buffered per member before it is evicted.
pub const DEFAULT_RELIABLE_CAPACITY: usize = 1024;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub members_evicted: u64,
    pub active_peers: usize,
}

/// Lock-free counters updated on the fan-out path.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    members_evicted: AtomicU64,
}

/// Raised once when a member overflows its reliable queue.
#[derive(Debug, Default)]
pub struct Eviction {
    flagged: AtomicBool,
    notify: Notify,
}

impl Eviction {
    /// Flag the member. Returns true only for the first call.
    fn raise(&self) -> bool {
        let first = !self.flagged.swap(true, Ordering::AcqRel);
        if first {
            self.notify.notify_one();
        }
        first
    }

    pub fn is_evicted(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    /// Resolves once the member has been evicted.
    pub async fn wait(&self) {
        if !self.is_evicted() {
            self.notify.notified().await;
        }
    }
}

/// Write half of a member's outbound queues, held by every room it joins.
#[derive(Debug, Clone)]
pub struct PeerSender {
    reliable: mpsc::Sender<Frame>,
    volatile: mpsc::Sender<Frame>,
    eviction: Arc<Eviction>,
}

/// Read half of a member's outbound queues, drained by its socket task.
#[derive(Debug)]
pub struct PeerQueues {
    pub reliable: mpsc::Receiver<Frame>,
    pub volatile: mpsc::Receiver<Frame>,
    pub eviction: Arc<Eviction>,
}

/// Create the queue pair for one connection with the default reliable
/// high-water mark.
pub fn peer_channel(volatile_capacity: usize) -> (PeerSender, PeerQueues) {
    bounded_peer_channel(volatile_capacity, DEFAULT_RELIABLE_CAPACITY)
}

pub fn bounded_peer_channel(
    volatile_capacity: usize,
    reliable_capacity: usize,
) -> (PeerSender, PeerQueues) {
    let (reliable_tx, reliable_rx) = mpsc::channel(reliable_capacity.max(1));
    let (volatile_tx, volatile_rx) = mpsc::channel(volatile_capacity.max(1));
    let eviction = Arc::new(Eviction::default());
    (
        PeerSender {
            reliable: reliable_tx,
            volatile: volatile_tx,
            eviction: eviction.clone(),
        },
        PeerQueues {
            reliable: reliable_rx,
            volatile: volatile_rx,
            eviction,
        },
    )
}

/// Outcome of handing a frame to one member.
enum Handoff {
    Queued,
    Dropped,
    Evicted { first: bool },
    Gone,
}

impl PeerSender {
    fn push(&self, frame: Frame, class: DeliveryClass) -> Handoff {
        if self.eviction.is_evicted() {
            return Handoff::Evicted { first: false };
        }
        match class {
            DeliveryClass::Reliable => match self.reliable.try_send(frame) {
                Ok(()) => Handoff::Queued,
                Err(TrySendError::Full(_)) => Handoff::Evicted {
                    first: self.eviction.raise(),
                },
                Err(TrySendError::Closed(_)) => Handoff::Gone,
            },
            DeliveryClass::Volatile => match self.volatile.try_send(frame) {
                Ok(()) => Handoff::Queued,
                Err(TrySendError::Full(_)) => Handoff::Dropped,
                Err(TrySendError::Closed(_)) => Handoff::Gone,
            },
        }
    }
}

/// Members of one document room.
pub struct BroadcastGroup {
    members: RwLock<HashMap<ConnectionId, PeerSender>>,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl Default for BroadcastGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastGroup {
    pub fn new() -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Add a member. Re-adding a connection replaces its sender.
    pub async fn add_peer(&self, connection: ConnectionId, sender: PeerSender) {
        self.members.write().await.insert(connection, sender);
    }

    pub async fn remove_peer(&self, connection: &ConnectionId) -> bool {
        self.members.write().await.remove(connection).is_some()
    }

    /// Encode once and fan out to every member except `exclude`.
    ///
    /// Returns the number of members the frame was queued for.
    pub async fn broadcast(
        &self,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let frame: Frame = Arc::from(event.encode()?);
        Ok(self.broadcast_raw(frame, event.delivery(), exclude).await)
    }

    /// Fan out a pre-encoded frame.
    pub async fn broadcast_raw(
        &self,
        frame: Frame,
        class: DeliveryClass,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let members = self.members.read().await;
        let mut queued = 0;
        for (connection, sender) in members.iter() {
            if Some(*connection) == exclude {
                continue;
            }
            match sender.push(frame.clone(), class) {
                Handoff::Queued => queued += 1,
                Handoff::Dropped => {
                    self.atomic_stats
                        .messages_dropped
                        .fetch_add(1, Ordering::Relaxed);
                    log::trace!("Cursor frame dropped for slow member {connection}");
                }
                Handoff::Evicted { first: true } => {
                    self.atomic_stats
                        .members_evicted
                        .fetch_add(1, Ordering::Relaxed);
                    log::warn!("Evicting {connection}: reliable queue full");
                }
                Handoff::Evicted { first: false } => {}
                // Socket task already gone; disconnect cleanup removes it.
                Handoff::Gone => {}
            }
        }
        self.atomic_stats
            .messages_sent
            .fetch_add(queued as u64, Ordering::Relaxed);
        queued
    }

    pub async fn peer_count(&self) -> usize {
        self.members.read().await.len()
    }

    pub async fn has_peer(&self, connection: &ConnectionId) -> bool {
        self.members.read().await.contains_key(connection)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            members_evicted: self.atomic_stats.members_evicted.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }
}

/// Room manager: maps document ids to broadcast groups.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Add a connection to a room, creating the room on first join.
    ///
    /// Holds the room map lock until the member is added so a concurrent
    /// `leave_all` cannot drop the room in between.
    pub async fn join(&self, room_id: &str, connection: ConnectionId, sender: PeerSender) {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room_id.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new()))
            .clone();
        group.add_peer(connection, sender).await;
    }

    /// Remove a connection from every room; empty rooms are dropped.
    /// Returns the ids of the rooms it was removed from.
    pub async fn leave_all(&self, connection: ConnectionId) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        let mut emptied = Vec::new();
        for (room_id, group) in rooms.iter() {
            if group.remove_peer(&connection).await {
                left.push(room_id.clone());
            }
            if group.peer_count().await == 0 {
                emptied.push(room_id.clone());
            }
        }
        for room_id in emptied {
            rooms.remove(&room_id);
        }
        left
    }

    /// Broadcast to a room if it exists. Returns the number of members reached.
    pub async fn broadcast(
        &self,
        room_id: &str,
        event: &ServerEvent,
        exclude: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        match self.get(room_id).await {
            Some(group) => group.broadcast(event, exclude).await,
            None => Ok(0),
        }
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Element;
    use crate::protocol::{CursorFrame, ElementDelta};

    fn delta() -> ServerEvent {
        ServerEvent::ElementUpdate(ElementDelta {
            document_id: "doc".into(),
            elements: vec![Element::new("a", 1, 1, 0.0)],
            participant_id: "u1".into(),
        })
    }

    fn cursor() -> ServerEvent {
        ServerEvent::CursorMove(CursorFrame {
            document_id: "doc".into(),
            ..CursorFrame::default()
        })
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new();
        let conn = ConnectionId::new();
        let (tx, _queues) = peer_channel(4);

        group.add_peer(conn, tx).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&conn).await);

        assert!(group.remove_peer(&conn).await);
        assert!(!group.remove_peer(&conn).await);
        assert_eq!(group.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_excludes_sender() {
        let group = BroadcastGroup::new();
        let sender = ConnectionId::new();
        let (tx1, mut q1) = peer_channel(4);
        let (tx2, mut q2) = peer_channel(4);
        let (tx3, mut q3) = peer_channel(4);
        group.add_peer(sender, tx1).await;
        group.add_peer(ConnectionId::new(), tx2).await;
        group.add_peer(ConnectionId::new(), tx3).await;

        let count = group.broadcast(&delta(), Some(sender)).await.unwrap();
        assert_eq!(count, 2);

        assert!(q1.reliable.try_recv().is_err());
        let frame = q2.reliable.try_recv().unwrap();
        assert!(frame.contains("element-update"));
        assert_eq!(q3.reliable.try_recv().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_presence_reaches_whole_room() {
        let group = BroadcastGroup::new();
        let (tx1, mut q1) = peer_channel(4);
        let (tx2, mut q2) = peer_channel(4);
        group.add_peer(ConnectionId::new(), tx1).await;
        group.add_peer(ConnectionId::new(), tx2).await;

        let count = group
            .broadcast(&ServerEvent::PresenceUpdate(vec![]), None)
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert!(q1.reliable.try_recv().is_ok());
        assert!(q2.reliable.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_cursor_uses_volatile_queue() {
        let group = BroadcastGroup::new();
        let (tx, mut q) = peer_channel(4);
        group.add_peer(ConnectionId::new(), tx).await;

        group.broadcast(&cursor(), None).await.unwrap();
        assert!(q.reliable.try_recv().is_err());
        assert!(q.volatile.try_recv().unwrap().contains("cursor-move"));
    }

    #[tokio::test]
    async fn test_slow_member_drops_cursors_only() {
        let group = BroadcastGroup::new();
        let slow = ConnectionId::new();
        let (slow_tx, mut slow_q) = peer_channel(2);
        let (fast_tx, mut fast_q) = peer_channel(64);
        group.add_peer(slow, slow_tx).await;
        group.add_peer(ConnectionId::new(), fast_tx).await;

        for _ in 0..10 {
            group.broadcast(&cursor(), None).await.unwrap();
        }
        group.broadcast(&delta(), None).await.unwrap();

        let stats = group.stats().await;
        assert_eq!(stats.messages_dropped, 8);
        assert_eq!(stats.active_peers, 2);

        // The fast member saw every cursor
        let mut fast_cursors = 0;
        while fast_q.volatile.try_recv().is_ok() {
            fast_cursors += 1;
        }
        assert_eq!(fast_cursors, 10);

        // The slow member lost cursors but not the element delta
        let mut slow_cursors = 0;
        while slow_q.volatile.try_recv().is_ok() {
            slow_cursors += 1;
        }
        assert_eq!(slow_cursors, 2);
        assert!(slow_q.reliable.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_stalled_member_evicted_at_high_water_mark() {
        let group = BroadcastGroup::new();
        let stalled = ConnectionId::new();
        let (stalled_tx, mut stalled_q) = bounded_peer_channel(4, 2);
        let (live_tx, mut live_q) = bounded_peer_channel(4, 64);
        group.add_peer(stalled, stalled_tx).await;
        group.add_peer(ConnectionId::new(), live_tx).await;

        for _ in 0..5 {
            group.broadcast(&delta(), None).await.unwrap();
        }

        let stats = group.stats().await;
        assert_eq!(stats.members_evicted, 1);
        assert_eq!(stats.messages_dropped, 0);

        // The stalled member is told to close instead of missing frames quietly
        assert!(stalled_q.eviction.is_evicted());
        tokio::time::timeout(std::time::Duration::from_secs(1), stalled_q.eviction.wait())
            .await
            .expect("eviction never signalled");
        let mut queued = 0;
        while stalled_q.reliable.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);

        // Everyone else is unaffected
        let mut delivered = 0;
        while live_q.reliable.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 5);

        // Cursors stop too once a member is evicted
        group.broadcast(&cursor(), None).await.unwrap();
        assert!(stalled_q.volatile.try_recv().is_err());
        assert!(live_q.volatile.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_closed_member_is_skipped() {
        let group = BroadcastGroup::new();
        let (tx, queues) = peer_channel(4);
        group.add_peer(ConnectionId::new(), tx).await;
        drop(queues);

        assert_eq!(group.broadcast(&delta(), None).await.unwrap(), 0);
        assert_eq!(group.stats().await.messages_dropped, 0);
    }

    #[tokio::test]
    async fn test_room_isolation() {
        let manager = RoomManager::new();
        let (tx_a, mut q_a) = peer_channel(4);
        let (tx_b, mut q_b) = peer_channel(4);
        manager.join("doc-a", ConnectionId::new(), tx_a).await;
        manager.join("doc-b", ConnectionId::new(), tx_b).await;

        let count = manager.broadcast("doc-a", &delta(), None).await.unwrap();
        assert_eq!(count, 1);
        assert!(q_a.reliable.try_recv().is_ok());
        assert!(q_b.reliable.try_recv().is_err());

        assert_eq!(manager.broadcast("missing", &delta(), None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_leave_all_drops_empty_rooms() {
        let manager = RoomManager::new();
        let conn = ConnectionId::new();
        let other = ConnectionId::new();
        let (tx, _q) = peer_channel(4);
        let (other_tx, _other_q) = peer_channel(4);
        manager.join("doc-a", conn, tx.clone()).await;
        manager.join("doc-b", conn, tx).await;
        manager.join("doc-b", other, other_tx).await;

        let mut left = manager.leave_all(conn).await;
        left.sort();
        assert_eq!(left, ["doc-a", "doc-b"]);

        let mut active = manager.active_rooms().await;
        active.sort();
        assert_eq!(active, ["doc-b"]);
    }
}
