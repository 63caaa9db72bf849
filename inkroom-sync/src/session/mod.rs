//! Client-side sync session: one open document, one cooperative task.
//!
//! ```text
//!            SurfaceEvent            SyncEvent           PersistOutcome
//!                │                       │                     │
//!                ▼                       ▼                     ▼
//!   ┌──────────────────────── SyncSession::run ─────────────────────────┐
//!   │  select! { host input | relay events | persistence | timer | tick }│
//!   └──────┬──────────────────────┬─────────────────────────┬────────────┘
//!          ▼                      ▼                         ▼
//!     SessionState            SyncClient          PersistencePipeline
//!   (ledger, timers,     (reliable + cursor       (spawn_blocking saves
//!    presence, guard)          queues)              and previews)
//! ```

pub mod driver;
pub mod state;
pub mod surface;

pub use driver::SyncSession;
pub use state::{ChangeOutcome, Due, SessionState};
pub use surface::{Notice, Surface, SurfaceEvent};

use std::time::Duration;

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Cadences of the session's timer tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Minimum spacing of outbound cursor frames.
    pub cursor_interval: Duration,
    /// Throttle window for element broadcasts.
    pub broadcast_window: Duration,
    /// Quiet period before a durable save.
    pub save_debounce: Duration,
    /// Quiet period before a preview is rendered and stored.
    pub preview_debounce: Duration,
    /// How often buffered remote cursors are handed to the surface.
    pub cursor_tick: Duration,
    /// Outbound cursor frames queued before new ones are dropped.
    pub cursor_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cursor_interval: Duration::from_millis(50),
            broadcast_window: Duration::from_millis(100),
            save_debounce: Duration::from_millis(1000),
            preview_debounce: Duration::from_millis(10_000),
            cursor_tick: Duration::from_millis(16),
            cursor_queue_capacity: 16,
        }
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("No document is open")]
    NoDocument,
}
