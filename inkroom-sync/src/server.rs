//! WebSocket relay with room-based routing and presence.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── PresenceRegistry (one async mutex)
//!            ├── Room (document id) ┤
//! Client B ──┘                      └── BroadcastGroup
//!                                          │  per-member queues
//!                              ┌───────────┼────────────┐
//!                              ▼           ▼            ▼
//!                          Client A    Client B     Client C
//! ```
//!
//! The relay holds no document state. It tracks who is in which room and
//! forwards frames; reconciliation happens on the clients.
//!
//! One task per connection runs a `select!` over inbound frames and the
//! connection's two outbound queues. A member that stops draining its
//! reliable queue is evicted and its socket closed. Handlers for one connection run
//! strictly in order; connections and rooms proceed concurrently.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{
    bounded_peer_channel, PeerSender, RoomManager, DEFAULT_RELIABLE_CAPACITY,
};
use crate::participant::ConnectionId;
use crate::protocol::{ClientEvent, JoinRoom, ProtocolError, ServerEvent};
use crate::registry::PresenceRegistry;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Cursor frames buffered per member before new ones are dropped
    pub cursor_queue_capacity: usize,
    /// Reliable frames buffered per member before it is disconnected
    pub reliable_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
            cursor_queue_capacity: 16,
            reliable_queue_capacity: DEFAULT_RELIABLE_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Configuration from the process environment.
    ///
    /// `INKROOM_BIND_ADDR` wins over `PORT`; `PORT` alone binds every
    /// interface. `INKROOM_CURSOR_QUEUE` and `INKROOM_RELIABLE_QUEUE`
    /// override the per-member queue sizes.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = lookup("INKROOM_BIND_ADDR").filter(|a| !a.is_empty()) {
            config.bind_addr = addr;
        } else if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(capacity) = lookup("INKROOM_CURSOR_QUEUE")
            .and_then(|c| c.trim().parse::<usize>().ok())
            .filter(|c| *c > 0)
        {
            config.cursor_queue_capacity = capacity;
        }
        if let Some(capacity) = lookup("INKROOM_RELIABLE_QUEUE")
            .and_then(|c| c.trim().parse::<usize>().ok())
            .filter(|c| *c > 0)
        {
            config.reliable_queue_capacity = capacity;
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub evicted_connections: u64,
    pub active_rooms: usize,
}

/// Shared relay state handed to every connection task.
#[derive(Clone)]
struct Relay {
    room_manager: Arc<RoomManager>,
    registry: Arc<Mutex<PresenceRegistry>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Relay {
    fn new() -> Self {
        Self {
            room_manager: Arc::new(RoomManager::new()),
            registry: Arc::new(Mutex::new(PresenceRegistry::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Decode and route one inbound frame. Malformed frames are dropped.
    async fn dispatch(&self, connection: ConnectionId, peer: &PeerSender, bytes: &[u8]) {
        let event = match ClientEvent::decode(bytes) {
            Ok(event) => event,
            Err(e) => {
                self.stats.write().await.malformed_messages += 1;
                log::warn!("Ignoring malformed frame from {connection}: {e}");
                return;
            }
        };

        {
            let mut s = self.stats.write().await;
            s.total_messages += 1;
            s.total_bytes += bytes.len() as u64;
        }
        log::debug!("{} from {connection} for {}", event.name(), event.document_id());

        let result = match event {
            ClientEvent::JoinRoom(join) => self.join(connection, peer, join).await,
            ClientEvent::CursorMove(frame) => {
                let room = frame.document_id.clone();
                self.forward(&room, ServerEvent::CursorMove(frame), connection)
                    .await
            }
            ClientEvent::ElementUpdate(delta) => {
                let room = delta.document_id.clone();
                self.forward(&room, ServerEvent::ElementUpdate(delta), connection)
                    .await
            }
            ClientEvent::UserActivity(activity) => {
                self.set_activity(connection, activity.is_active).await
            }
        };

        if let Err(e) = result {
            log::error!("Failed to relay frame from {connection}: {e}");
        }
    }

    async fn join(
        &self,
        connection: ConnectionId,
        peer: &PeerSender,
        join: JoinRoom,
    ) -> Result<(), ProtocolError> {
        if join.document_id.is_empty() {
            log::warn!("Join without document id from {connection}");
            return Ok(());
        }

        self.room_manager
            .join(&join.document_id, connection, peer.clone())
            .await;

        // Mutate and rebroadcast under one lock: every member sees the
        // presence lists of a room in mutation order.
        let mut registry = self.registry.lock().await;
        let participants = registry.join(&join.document_id, join.participant, connection);
        log::info!(
            "{connection} joined room {} ({} present)",
            join.document_id,
            participants.len()
        );
        self.room_manager
            .broadcast(
                &join.document_id,
                &ServerEvent::PresenceUpdate(participants),
                None,
            )
            .await?;
        self.stats.write().await.active_rooms = registry.room_count();
        Ok(())
    }

    /// Relay to everyone else in the room.
    async fn forward(
        &self,
        room_id: &str,
        event: ServerEvent,
        sender: ConnectionId,
    ) -> Result<(), ProtocolError> {
        let reached = self
            .room_manager
            .broadcast(room_id, &event, Some(sender))
            .await?;
        log::trace!("{} from {sender} reached {reached} members", event.name());
        Ok(())
    }

    async fn set_activity(
        &self,
        connection: ConnectionId,
        is_active: bool,
    ) -> Result<(), ProtocolError> {
        let mut registry = self.registry.lock().await;
        for room in registry.set_activity(connection, is_active) {
            self.room_manager
                .broadcast(
                    &room.room_id,
                    &ServerEvent::PresenceUpdate(room.participants),
                    None,
                )
                .await?;
        }
        Ok(())
    }

    /// Remove a connection everywhere and tell the remaining members.
    async fn disconnect(&self, connection: ConnectionId) {
        self.room_manager.leave_all(connection).await;

        let mut registry = self.registry.lock().await;
        for room in registry.disconnect(connection) {
            log::info!(
                "{connection} left room {} ({} remaining)",
                room.room_id,
                room.participants.len()
            );
            if room.participants.is_empty() {
                continue;
            }
            let event = ServerEvent::PresenceUpdate(room.participants);
            if let Err(e) = self.room_manager.broadcast(&room.room_id, &event, None).await {
                log::error!("Failed to publish presence for {}: {e}", room.room_id);
            }
        }
        self.stats.write().await.active_rooms = registry.room_count();
    }
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    relay: Relay,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            relay: Relay::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let limits = (
                self.config.cursor_queue_capacity,
                self.config.reliable_queue_capacity,
            );
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, relay, limits).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Relay,
        (cursor_capacity, reliable_capacity): (usize, usize),
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection = ConnectionId::new();
        log::info!("WebSocket connection {connection} established from {addr}");
        {
            let mut s = relay.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (peer, mut queues) = bounded_peer_channel(cursor_capacity, reliable_capacity);
        let eviction = queues.eviction.clone();

        loop {
            let outbound = tokio::select! {
                biased;

                _ = eviction.wait() => break,

                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        relay.dispatch(connection, &peer, text.as_bytes()).await;
                        None
                    }
                    Some(Ok(Message::Binary(data))) => {
                        relay.dispatch(connection, &peer, &data).await;
                        None
                    }
                    Some(Ok(Message::Ping(data))) => Some(Message::Pong(data)),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on {connection}: {e}");
                        break;
                    }
                },

                Some(frame) = queues.reliable.recv() => {
                    Some(Message::Text(frame.to_string().into()))
                }

                Some(frame) = queues.volatile.recv() => {
                    Some(Message::Text(frame.to_string().into()))
                }
            };

            if let Some(message) = outbound {
                let sent = tokio::select! {
                    result = ws_sender.send(message) => result,
                    _ = eviction.wait() => break,
                };
                if let Err(e) = sent {
                    log::debug!("Send to {connection} failed: {e}");
                    break;
                }
            }
        }

        if eviction.is_evicted() {
            log::warn!("Closing {connection}: it stopped draining its reliable queue");
            relay.stats.write().await.evicted_connections += 1;
        }

        relay.disconnect(connection).await;
        {
            let mut s = relay.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {connection} closed");
        Ok(())
    }

    pub async fn stats(&self) -> ServerStats {
        self.relay.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.relay.room_manager
    }
}
