//! Synchronous state machine behind a sync session.
//!
//! No I/O and no clock reads happen here: every operation takes the current
//! instant and returns what the driver should do next. That keeps the
//! bootstrapping guard, echo suppression and timer tiers testable step by
//! step.
//!
//! ```text
//! change notification
//!   │ closing?                       → ignored
//!   │ first after hydration, same    → suppressed
//!   │ bootstrapping, nothing drawn   → held back
//!   ▼
//! latest snapshot ──┬─► broadcast throttle (leading + trailing)
//!                   ├─► save debounce
//!                   └─► preview debounce
//! ```

use std::collections::HashSet;
use std::time::Instant;

use crate::element::{same_stamps, AppState, Element, Scene};
use crate::ledger::VersionLedger;
use crate::participant::{Participant, ParticipantIdentity};
use crate::persistence::Snapshot;
use crate::presence::{Collaborator, PresenceView};
use crate::protocol::{CursorFrame, ElementDelta, Pointer};
use crate::reconcile::reconcile_into;
use crate::timing::{Debounce, RateLimiter, Throttle};

use super::SessionConfig;

/// What happened to a change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// Session is closing.
    Ignored,
    /// Echo of the hydration itself.
    Suppressed,
    /// Bootstrapping and nothing renderable yet.
    HeldBack,
    /// Accepted; `broadcast` carries the leading emission, if any.
    Accepted { broadcast: Option<ElementDelta> },
}

/// Work that became due on a timer.
#[derive(Debug, Clone, PartialEq)]
pub enum Due {
    Broadcast(ElementDelta),
    Save(Snapshot),
    Preview(Snapshot),
}

pub struct SessionState {
    document_id: String,
    participant_id: String,
    ledger: VersionLedger,
    presence: PresenceView,
    baseline: Vec<Element>,
    latest: Snapshot,
    hydrated: bool,
    bootstrapping: bool,
    closing: bool,
    broadcast: Throttle,
    save: Debounce,
    preview: Debounce,
}

impl SessionState {
    pub fn new(
        document_id: impl Into<String>,
        identity: ParticipantIdentity,
        config: &SessionConfig,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            participant_id: identity.id.clone(),
            presence: PresenceView::new(
                document_id.clone(),
                identity,
                RateLimiter::new(config.cursor_interval),
            ),
            document_id,
            ledger: VersionLedger::new(),
            baseline: Vec::new(),
            latest: Snapshot::default(),
            hydrated: false,
            bootstrapping: true,
            closing: false,
            broadcast: Throttle::new(config.broadcast_window),
            save: Debounce::new(config.save_debounce),
            preview: Debounce::new(config.preview_debounce),
        }
    }

    /// Record the loaded document as the baseline.
    ///
    /// Every loaded element enters the ledger so that the surface's echo of
    /// the hydration is never broadcast.
    pub fn hydrate(&mut self, elements: &[Element], app_state: AppState) {
        self.ledger.clear();
        self.ledger.record_all(elements);
        self.baseline = elements.to_vec();
        self.latest = Snapshot {
            elements: elements.to_vec(),
            app_state,
        };
        self.hydrated = false;
        self.bootstrapping = true;
        self.broadcast.cancel();
        self.save.cancel();
        self.preview.cancel();
    }

    /// Handle the surface's change notification.
    pub fn on_scene_change(
        &mut self,
        elements: Vec<Element>,
        app_state: AppState,
        now: Instant,
    ) -> ChangeOutcome {
        if self.closing {
            log::debug!("Ignoring change for {} during teardown", self.document_id);
            return ChangeOutcome::Ignored;
        }

        let renderable = elements.iter().any(Element::is_renderable);

        if !self.hydrated {
            self.hydrated = true;
            if same_stamps(&elements, &self.baseline) {
                if renderable {
                    self.bootstrapping = false;
                }
                log::debug!("Hydration echo for {} suppressed", self.document_id);
                return ChangeOutcome::Suppressed;
            }
        }

        self.latest = Snapshot {
            elements,
            app_state,
        };

        if self.bootstrapping && !renderable {
            log::debug!("Holding back empty scene while {} bootstraps", self.document_id);
            return ChangeOutcome::HeldBack;
        }
        self.bootstrapping = false;

        let broadcast = if self.broadcast.call(now) {
            self.take_changes()
        } else {
            None
        };
        self.save.schedule(now);
        self.preview.schedule(now);
        ChangeOutcome::Accepted { broadcast }
    }

    /// Outbound cursor frame for a pointer move, if the rate limit allows.
    pub fn on_pointer(
        &mut self,
        pointer: Pointer,
        button: &str,
        selected: &HashSet<String>,
        now: Instant,
    ) -> Option<CursorFrame> {
        if self.closing {
            return None;
        }
        self.presence.local_cursor(pointer, button, selected, now)
    }

    /// Merge a remote delta into the surface's current elements.
    ///
    /// Elements the local user has selected are skipped so an in-progress
    /// drag is never yanked away. Returns the merged element list for the
    /// surface, or `None` when the delta is for another document.
    pub fn on_remote_elements(
        &mut self,
        delta: &ElementDelta,
        local: Vec<Element>,
        selected: &HashSet<String>,
    ) -> Option<Vec<Element>> {
        if self.closing {
            return None;
        }
        if !delta.document_id.is_empty() && delta.document_id != self.document_id {
            log::warn!(
                "Dropping delta for {} on session {}",
                delta.document_id,
                self.document_id
            );
            return None;
        }

        let accepted: Vec<Element> = delta
            .elements
            .iter()
            .filter(|e| !selected.contains(&e.id))
            .cloned()
            .collect();

        let mut scene = Scene::from_elements(local);
        let taken = reconcile_into(&mut scene, &accepted);
        self.ledger.record_all(&accepted);
        log::debug!(
            "Applied {taken}/{} remote elements from {}",
            delta.elements.len(),
            delta.participant_id
        );

        let merged = scene.into_elements();
        self.latest.elements = merged.clone();
        Some(merged)
    }

    pub fn on_remote_cursor(&mut self, frame: CursorFrame) {
        if frame.document_id.is_empty() || frame.document_id == self.document_id {
            self.presence.buffer_cursor(frame);
        }
    }

    /// Apply a presence list. Returns the ids of inactive peers.
    pub fn on_presence(&mut self, participants: Vec<Participant>) -> Vec<String> {
        self.presence.apply_presence(participants)
    }

    pub fn drain_cursors(&mut self) -> Vec<Collaborator> {
        self.presence.drain_cursors()
    }

    /// Everything whose timer has expired at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<Due> {
        let mut due = Vec::new();
        if self.closing {
            return due;
        }
        if self.broadcast.fire_if_due(now) {
            if let Some(delta) = self.take_changes() {
                due.push(Due::Broadcast(delta));
            }
        }
        if self.save.fire_if_due(now) {
            due.push(Due::Save(self.latest.clone()));
        }
        if self.preview.fire_if_due(now) {
            due.push(Due::Preview(self.latest.clone()));
        }
        due
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.broadcast.deadline(),
            self.save.deadline(),
            self.preview.deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Snapshot for a manual save, taken from the surface's live elements.
    pub fn snapshot_now(&mut self, elements: Vec<Element>) -> Snapshot {
        self.latest.elements = elements;
        self.latest.clone()
    }

    /// Stop reacting to anything and drop pending timers.
    pub fn close(&mut self) {
        self.closing = true;
        self.broadcast.cancel();
        self.save.cancel();
        self.preview.cancel();
    }

    fn take_changes(&mut self) -> Option<ElementDelta> {
        let changed = self.ledger.collect_changes(&self.latest.elements);
        if changed.is_empty() {
            return None;
        }
        Some(ElementDelta {
            document_id: self.document_id.clone(),
            elements: changed,
            participant_id: self.participant_id.clone(),
        })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn latest(&self) -> &Snapshot {
        &self.latest
    }

    pub fn peers(&self) -> &[Participant] {
        self.presence.peers()
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}
