//! Boundary between a sync session and the drawing surface it serves.

use std::collections::HashSet;

use crate::element::{AppState, Element};
use crate::participant::Participant;
use crate::presence::Collaborator;
use crate::protocol::Pointer;

/// The drawing surface a session keeps in sync.
///
/// The surface is opaque: it produces and consumes ordered element lists
/// and an app-state blob. All calls come from the session task.
pub trait Surface: Send {
    /// Current elements, tombstones included.
    fn scene_elements(&self) -> Vec<Element>;

    /// Ids of the elements the local user has selected.
    fn selected_element_ids(&self) -> HashSet<String>;

    /// Replace everything with a freshly loaded document.
    fn load_scene(&mut self, elements: Vec<Element>, app_state: AppState);

    /// Replace the elements after a remote merge; app state is untouched.
    fn replace_elements(&mut self, elements: Vec<Element>);

    /// Upsert remote cursors.
    fn update_collaborators(&mut self, collaborators: Vec<Collaborator>);

    /// Remove remote cursors by participant id.
    fn remove_collaborators(&mut self, ids: &[String]);

    /// Who else is in the document.
    fn update_peers(&mut self, _peers: &[Participant]) {}

    /// User-facing toast.
    fn notify(&mut self, _notice: Notice) {}
}

/// User-facing outcome messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Manual save went through.
    Saved,
    SaveFailed(String),
    LoadFailed(String),
}

impl Notice {
    pub fn message(&self) -> &str {
        match self {
            Notice::Saved => "Saved changes to server",
            Notice::SaveFailed(_) => "Failed to save changes",
            Notice::LoadFailed(_) => "Failed to load document",
        }
    }
}

/// Inputs from the host application.
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceEvent {
    OpenDocument(String),
    /// The surface's change notification.
    SceneChanged {
        elements: Vec<Element>,
        app_state: AppState,
    },
    PointerMoved {
        pointer: Pointer,
        button: String,
    },
    /// Editor gained (`true`) or lost focus.
    ActivityChanged(bool),
    SaveNow,
    Rename(String),
    Close,
}
