//! The cooperative task that ties a surface to the relay and to storage.

use std::future::pending;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::client::{SyncClient, SyncEvent};
use crate::element::{AppState, Element};
use crate::participant::ParticipantIdentity;
use crate::persistence::{PersistOutcome, PersistencePipeline, PreviewRenderer};
use crate::protocol::{ElementDelta, Pointer};
use crate::storage::DocumentStore;

use super::state::{ChangeOutcome, Due, SessionState};
use super::surface::{Notice, Surface, SurfaceEvent};
use super::{SessionConfig, SessionError};

/// Keeps one surface in sync with one document at a time.
pub struct SyncSession<S: Surface> {
    config: SessionConfig,
    identity: ParticipantIdentity,
    server_url: String,
    surface: S,
    pipeline: PersistencePipeline,
    outcomes: mpsc::UnboundedReceiver<PersistOutcome>,
    state: Option<SessionState>,
    client: Option<SyncClient>,
    events: Option<mpsc::Receiver<SyncEvent>>,
}

impl<S: Surface> SyncSession<S> {
    pub fn new(
        identity: ParticipantIdentity,
        server_url: impl Into<String>,
        surface: S,
        store: Arc<dyn DocumentStore>,
        renderer: Arc<dyn PreviewRenderer>,
        config: SessionConfig,
    ) -> Self {
        let (pipeline, outcomes) = PersistencePipeline::new(store, renderer);
        Self {
            config,
            identity,
            server_url: server_url.into(),
            surface,
            pipeline,
            outcomes,
            state: None,
            client: None,
            events: None,
        }
    }

    /// Switch to `document_id`: tear down the previous document, load and
    /// hydrate the new one, then connect and join its room.
    ///
    /// A failed load falls back to an empty scene. A failed connect is
    /// returned, but the document stays open for local editing and saves.
    pub async fn open_document(&mut self, document_id: &str) -> Result<(), SessionError> {
        self.teardown().await;

        let (elements, app_state) = match self.pipeline.load(document_id).await {
            Ok(doc) => {
                log::info!(
                    "Loaded document {document_id} ({} elements, v{})",
                    doc.elements.len(),
                    doc.version
                );
                (doc.elements, AppState::hydrate(doc.app_state))
            }
            Err(e) => {
                log::error!("Loading document {document_id} failed: {e}");
                self.surface.notify(Notice::LoadFailed(e.to_string()));
                (Vec::new(), AppState::hydrate(AppState::new()))
            }
        };

        let mut state = SessionState::new(document_id, self.identity.clone(), &self.config);
        state.hydrate(&elements, app_state.clone());
        self.state = Some(state);
        self.surface.load_scene(elements, app_state);

        let mut client = SyncClient::new(self.identity.clone(), document_id, &self.server_url)
            .with_cursor_capacity(self.config.cursor_queue_capacity);
        self.events = client.take_event_rx();
        let connected = client.connect().await;
        self.client = Some(client);
        connected.map_err(SessionError::from)
    }

    async fn teardown(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.close();
        }
        if let Some(mut client) = self.client.take() {
            client.disconnect().await;
        }
        self.events = None;
        self.state = None;
    }

    /// Dispatch one host input. `Close` tears the document down.
    pub async fn handle_input(&mut self, event: SurfaceEvent) {
        match event {
            SurfaceEvent::OpenDocument(id) => {
                if let Err(e) = self.open_document(&id).await {
                    log::warn!("Document {id} opened offline: {e}");
                }
            }
            SurfaceEvent::SceneChanged {
                elements,
                app_state,
            } => self.handle_scene_change(elements, app_state, Instant::now()),
            SurfaceEvent::PointerMoved { pointer, button } => {
                self.handle_pointer(pointer, &button, Instant::now())
            }
            SurfaceEvent::ActivityChanged(is_active) => self.handle_activity(is_active),
            SurfaceEvent::SaveNow => {
                if let Err(e) = self.save_now() {
                    log::warn!("Save ignored: {e}");
                }
            }
            SurfaceEvent::Rename(name) => {
                if let Err(e) = self.rename(name) {
                    log::warn!("Rename ignored: {e}");
                }
            }
            SurfaceEvent::Close => self.close().await,
        }
    }

    pub fn handle_scene_change(
        &mut self,
        elements: Vec<Element>,
        app_state: AppState,
        now: Instant,
    ) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        if let ChangeOutcome::Accepted {
            broadcast: Some(delta),
        } = state.on_scene_change(elements, app_state, now)
        {
            self.send_delta(delta);
        }
    }

    pub fn handle_pointer(&mut self, pointer: Pointer, button: &str, now: Instant) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let selected = self.surface.selected_element_ids();
        let Some(frame) = state.on_pointer(pointer, button, &selected, now) else {
            return;
        };
        if let Some(client) = self.client.as_mut() {
            if let Err(e) = client.send_cursor(frame) {
                log::trace!("Cursor not sent: {e}");
            }
        }
    }

    pub fn handle_activity(&mut self, is_active: bool) {
        if let Some(client) = self.client.as_ref() {
            if let Err(e) = client.send_activity(is_active) {
                log::debug!("Activity not sent: {e}");
            }
        }
    }

    pub fn handle_sync_event(&mut self, event: SyncEvent) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        match event {
            SyncEvent::Connected => log::debug!("Session for {} connected", state.document_id()),
            SyncEvent::Disconnected => {
                log::warn!("Session for {} lost its relay", state.document_id())
            }
            SyncEvent::PresenceUpdate(participants) => {
                let inactive = state.on_presence(participants);
                self.surface.update_peers(state.peers());
                if !inactive.is_empty() {
                    self.surface.remove_collaborators(&inactive);
                }
            }
            SyncEvent::CursorMove(frame) => state.on_remote_cursor(frame),
            SyncEvent::ElementUpdate(delta) => {
                let local = self.surface.scene_elements();
                let selected = self.surface.selected_element_ids();
                if let Some(merged) = state.on_remote_elements(&delta, local, &selected) {
                    self.surface.replace_elements(merged);
                }
            }
        }
    }

    pub fn handle_outcome(&mut self, outcome: PersistOutcome) {
        let current = self.state.as_ref().map(SessionState::document_id);
        if current != Some(outcome.document_id()) {
            log::debug!("Outcome for closed document {}", outcome.document_id());
            return;
        }
        match outcome {
            PersistOutcome::ManualSaved { .. } => self.surface.notify(Notice::Saved),
            PersistOutcome::SaveFailed { error, .. } => {
                self.surface.notify(Notice::SaveFailed(error.to_string()))
            }
            _ => {}
        }
    }

    /// Run every timer that expired at `now`.
    pub fn fire_due(&mut self, now: Instant) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let document_id = state.document_id().to_string();
        for due in state.poll(now) {
            match due {
                Due::Broadcast(delta) => self.send_delta(delta),
                Due::Save(snapshot) => {
                    self.pipeline.spawn_save(document_id.clone(), snapshot);
                }
                Due::Preview(snapshot) => {
                    self.pipeline.spawn_preview(document_id.clone(), snapshot);
                }
            }
        }
    }

    /// Hand buffered remote cursors to the surface.
    pub fn render_cursors(&mut self) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let collaborators = state.drain_cursors();
        if !collaborators.is_empty() {
            self.surface.update_collaborators(collaborators);
        }
    }

    /// Save and preview right away from the surface's live elements.
    /// Pending debounced work stays scheduled.
    pub fn save_now(&mut self) -> Result<(), SessionError> {
        let state = self.state.as_mut().ok_or(SessionError::NoDocument)?;
        let snapshot = state.snapshot_now(self.surface.scene_elements());
        self.pipeline
            .spawn_save_now(state.document_id().to_string(), snapshot);
        Ok(())
    }

    pub fn rename(&mut self, name: String) -> Result<(), SessionError> {
        let state = self.state.as_ref().ok_or(SessionError::NoDocument)?;
        self.pipeline.spawn_rename(state.document_id(), name);
        Ok(())
    }

    /// Stop reacting to changes and leave the room.
    pub async fn close(&mut self) {
        if let Some(state) = self.state.as_mut() {
            state.close();
        }
        if let Some(mut client) = self.client.take() {
            client.disconnect().await;
        }
        self.events = None;
    }

    fn send_delta(&self, delta: ElementDelta) {
        let count = delta.elements.len();
        match self.client.as_ref() {
            Some(client) => match client.send_delta(delta) {
                Ok(()) => log::trace!("Broadcast {count} changed elements"),
                Err(e) => log::debug!("Delta not sent: {e}"),
            },
            None => log::trace!("No relay, {count} changed elements kept local"),
        }
    }

    /// Next relay event, if connected.
    pub async fn next_sync_event(&mut self) -> Option<SyncEvent> {
        recv_event(&mut self.events).await
    }

    /// Drive the session until the host sends `Close` or drops its sender.
    /// Returns the surface.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<SurfaceEvent>) -> S {
        let mut tick = tokio::time::interval(self.config.cursor_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.state.as_ref().and_then(SessionState::next_deadline);
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(SurfaceEvent::Close) | None => {
                        self.close().await;
                        break;
                    }
                    Some(event) => self.handle_input(event).await,
                },
                Some(event) = recv_event(&mut self.events) => self.handle_sync_event(event),
                Some(outcome) = self.outcomes.recv() => self.handle_outcome(outcome),
                _ = sleep_until(deadline) => self.fire_due(Instant::now()),
                _ = tick.tick() => self.render_cursors(),
            }
        }

        log::info!("Sync session for {} stopped", self.identity.id);
        self.surface
    }

    pub fn document_id(&self) -> Option<&str> {
        self.state.as_ref().map(SessionState::document_id)
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }
}

async fn recv_event(events: &mut Option<mpsc::Receiver<SyncEvent>>) -> Option<SyncEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => pending().await,
    }
}
