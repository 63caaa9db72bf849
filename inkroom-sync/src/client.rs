//! WebSocket transport for one open document.
//!
//! `SyncClient` owns the socket. A writer task drains two outbound queues
//! (element deltas and activity are reliable, cursors are dropped when
//! their small queue is full) and a reader task decodes relay frames into
//! [`SyncEvent`]s. Tearing the client down aborts both tasks.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::element::Element;
use crate::participant::{Participant, ParticipantIdentity};
use crate::protocol::{
    ClientEvent, CursorFrame, ElementDelta, JoinRoom, ProtocolError, ServerEvent, UserActivity,
};

/// Connection state of a sync client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events delivered from the relay to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    PresenceUpdate(Vec<Participant>),
    CursorMove(CursorFrame),
    ElementUpdate(ElementDelta),
}

impl From<ServerEvent> for SyncEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::PresenceUpdate(list) => SyncEvent::PresenceUpdate(list),
            ServerEvent::CursorMove(frame) => SyncEvent::CursorMove(frame),
            ServerEvent::ElementUpdate(delta) => SyncEvent::ElementUpdate(delta),
        }
    }
}

/// Client end of a relay connection, scoped to one document.
pub struct SyncClient {
    identity: ParticipantIdentity,
    document_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    reliable_tx: Option<mpsc::UnboundedSender<String>>,
    volatile_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    cursor_capacity: usize,
    cursors_dropped: u64,
}

impl SyncClient {
    pub fn new(
        identity: ParticipantIdentity,
        document_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            identity,
            document_id: document_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            reliable_tx: None,
            volatile_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            reader: None,
            writer: None,
            cursor_capacity: 16,
            cursors_dropped: 0,
        }
    }

    /// Size of the outbound cursor queue (builder style).
    pub fn with_cursor_capacity(mut self, capacity: usize) -> Self {
        self.cursor_capacity = capacity.max(1);
        self
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, spawn the reader and writer tasks and join the room.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (reliable_tx, mut reliable_rx) = mpsc::unbounded_channel::<String>();
        let (volatile_tx, mut volatile_rx) = mpsc::channel::<String>(self.cursor_capacity);

        // Join goes first so the relay knows our room before anything else.
        let join = ClientEvent::JoinRoom(JoinRoom {
            document_id: self.document_id.clone(),
            participant: self.identity.clone(),
        });
        reliable_tx
            .send(join.encode()?)
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        self.writer = Some(tokio::spawn(async move {
            loop {
                let text = tokio::select! {
                    biased;
                    msg = reliable_rx.recv() => match msg {
                        Some(text) => text,
                        None => break,
                    },
                    Some(text) = volatile_rx.recv() => text,
                };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        }));

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let bytes = match msg {
                    Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                    Ok(Message::Binary(data)) => data.to_vec(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match ServerEvent::decode(&bytes) {
                    Ok(event) => {
                        if event_tx.send(SyncEvent::from(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::warn!("Ignoring malformed relay frame: {e}"),
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        }));

        self.reliable_tx = Some(reliable_tx);
        self.volatile_tx = Some(volatile_tx);
        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!(
            "Connected to {} for document {} as {}",
            self.server_url,
            self.document_id,
            self.identity.id
        );
        Ok(())
    }

    /// Send changed elements to everyone else in the room.
    pub fn send_elements(&self, elements: Vec<Element>) -> Result<(), ProtocolError> {
        let event = ClientEvent::ElementUpdate(ElementDelta {
            document_id: self.document_id.clone(),
            elements,
            participant_id: self.identity.id.clone(),
        });
        self.send_reliable(&event)
    }

    pub fn send_delta(&self, delta: ElementDelta) -> Result<(), ProtocolError> {
        self.send_reliable(&ClientEvent::ElementUpdate(delta))
    }

    pub fn send_activity(&self, is_active: bool) -> Result<(), ProtocolError> {
        self.send_reliable(&ClientEvent::UserActivity(UserActivity {
            document_id: self.document_id.clone(),
            is_active,
        }))
    }

    /// Queue a cursor frame. Returns `Ok(false)` when it was dropped
    /// because the cursor queue is full.
    pub fn send_cursor(&mut self, frame: CursorFrame) -> Result<bool, ProtocolError> {
        let tx = self
            .volatile_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        match tx.try_send(ClientEvent::CursorMove(frame).encode()?) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => {
                self.cursors_dropped += 1;
                log::trace!("Cursor frame dropped, queue full");
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => Err(ProtocolError::ConnectionClosed),
        }
    }

    fn send_reliable(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let tx = self
            .reliable_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(event.encode()?)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. The writer flushes what is queued and sends a
    /// close frame; the reader is aborted immediately.
    pub async fn disconnect(&mut self) {
        self.reliable_tx = None;
        self.volatile_tx = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.writer = None;
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Disconnected from document {}", self.document_id);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn cursors_dropped(&self) -> u64 {
        self.cursors_dropped
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SyncClient {
        SyncClient::new(
            ParticipantIdentity::with_id("u1", "Ada"),
            "doc-1",
            "ws://127.0.0.1:1",
        )
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = client();
        assert_eq!(client.document_id(), "doc-1");
        assert_eq!(client.identity().name, "Ada");
        assert_eq!(client.server_url(), "ws://127.0.0.1:1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx_once() {
        let mut client = client();
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_closed() {
        let mut client = client();
        assert_eq!(
            client.send_elements(vec![Element::new("a", 1, 1, 0.0)]),
            Err(ProtocolError::ConnectionClosed)
        );
        assert_eq!(client.send_activity(false), Err(ProtocolError::ConnectionClosed));
        assert_eq!(
            client.send_cursor(CursorFrame::default()),
            Err(ProtocolError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let mut client = client();
        let result = client.connect().await;
        assert!(matches!(result, Err(ProtocolError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_sync_event_from_server_event() {
        assert_eq!(
            SyncEvent::from(ServerEvent::PresenceUpdate(vec![])),
            SyncEvent::PresenceUpdate(vec![])
        );
        assert_eq!(
            SyncEvent::from(ServerEvent::ElementUpdate(ElementDelta::default())),
            SyncEvent::ElementUpdate(ElementDelta::default())
        );
    }
}
