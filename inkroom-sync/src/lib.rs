//! # inkroom-sync: real-time sync layer for collaborative canvases
//!
//! Keeps many participants' views of one drawing document converged while
//! each edits locally, and persists a durable copy on a slower cadence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ SyncSession  │ ◄────────────────► │ SyncServer   │
//! │ (per user)   │    JSON envelopes  │ (relay)      │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ reconcile +  │                    │ Presence     │
//! │ VersionLedger│                    │ Registry     │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                            ┌──────┴───────┐
//! ┌──────────────┐                    │ RoomManager  │
//! │ Persistence  │                    │ (fan-out)    │
//! │ Pipeline     │                    └──────────────┘
//! └──────────────┘
//! ```
//!
//! The relay never interprets element contents: it forwards deltas and
//! cursors to everyone else in the room. Convergence comes from every
//! client running the same deterministic [`reconcile`] rule.
//!
//! ## Modules
//!
//! - [`element`]: Elements, scenes and app state
//! - [`reconcile`]: Version/nonce arbitration of remote elements
//! - [`ledger`]: Last broadcast stamp per element (delta extraction)
//! - [`protocol`]: Wire events and their JSON envelopes
//! - [`registry`]: Server-side room membership
//! - [`broadcast`]: Room fan-out with reliable and volatile queues
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket transport for one document
//! - [`presence`]: Client-side peers and remote cursors
//! - [`timing`]: Rate limit, throttle and debounce primitives
//! - [`session`]: Surface-facing session controller
//! - [`persistence`]: Debounced save and preview tiers
//! - [`storage`]: Document stores (in-memory, RocksDB)

pub mod element;
pub mod participant;
pub mod protocol;
pub mod reconcile;
pub mod ledger;
pub mod registry;
pub mod broadcast;
pub mod server;
pub mod client;
pub mod presence;
pub mod timing;
pub mod session;
pub mod persistence;
pub mod storage;

// Re-exports for convenience
pub use element::{same_stamps, AppState, Element, Scene, VersionStamp};
pub use participant::{ConnectionId, Participant, ParticipantIdentity};
pub use protocol::{
    ClientEvent, CursorFrame, DeliveryClass, ElementDelta, JoinRoom, Pointer, ProtocolError,
    ServerEvent, UserActivity,
};
pub use reconcile::{prefers_remote, reconcile, reconcile_into};
pub use ledger::VersionLedger;
pub use registry::{PresenceRegistry, RoomPresence};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, SyncEvent};
pub use presence::{Collaborator, CollaboratorColor, PresenceView};
pub use timing::{Debounce, RateLimiter, Throttle};
pub use session::{
    ChangeOutcome, Notice, SessionConfig, SessionError, SessionState, Surface, SurfaceEvent,
    SyncSession,
};
pub use persistence::{
    JsonPreviewRenderer, PersistOutcome, PersistencePipeline, PreviewError, PreviewRenderer,
    Snapshot,
};
pub use storage::{
    DocumentMetadata, DocumentPatch, DocumentStore, MemoryStore, RocksStore, StoreConfig,
    StoreError, StoredDocument,
};
