//! Durable document storage behind the persistence pipeline.
//!
//! ```text
//! PersistencePipeline ──► dyn DocumentStore
//!                             │
//!                 ┌───────────┴────────────┐
//!                 ▼                        ▼
//!            MemoryStore              RocksStore
//!            (in-process)      CF "documents": record (LZ4 JSON)
//!                              CF "previews":  preview (LZ4)
//!                              CF "metadata":  listing (bincode)
//! ```
//!
//! Elements and app state are stored as serialized JSON text. Every save
//! bumps a version counter owned by the store, and only the fields present
//! in a [`DocumentPatch`] are written.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

use crate::element::{AppState, Element};

/// A document as returned to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub name: String,
    pub elements: Vec<Element>,
    pub app_state: AppState,
    pub preview: Option<String>,
    pub version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    pub name: Option<String>,
    pub elements: Option<Vec<Element>>,
    pub app_state: Option<AppState>,
    pub preview: Option<String>,
}

impl DocumentPatch {
    /// Scene content: elements plus app state.
    pub fn content(elements: Vec<Element>, app_state: AppState) -> Self {
        Self {
            elements: Some(elements),
            app_state: Some(app_state),
            ..Self::default()
        }
    }

    pub fn preview(preview: impl Into<String>) -> Self {
        Self {
            preview: Some(preview.into()),
            ..Self::default()
        }
    }

    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    pub name: String,
    pub version: u64,
    pub element_count: u64,
    pub has_preview: bool,
    /// Milliseconds since epoch
    pub created_at: u64,
    /// Milliseconds since epoch
    pub updated_at: u64,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable storage collaborator. Calls block; the pipeline runs them on
/// the blocking pool.
pub trait DocumentStore: Send + Sync {
    fn load(&self, id: &str) -> Result<StoredDocument, StoreError>;

    /// Apply a patch and return the new version.
    fn save(&self, id: &str, patch: DocumentPatch) -> Result<u64, StoreError>;

    /// New empty document at version 1.
    fn create(&self, name: &str) -> Result<StoredDocument, StoreError>;

    /// Copy named `"<name> (Copy)"` at version 1, without the preview.
    fn duplicate(&self, id: &str) -> Result<StoredDocument, StoreError>;

    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Every document, most recently updated first.
    fn list(&self) -> Result<Vec<DocumentMetadata>, StoreError>;
}

// ─── Shared record representation ─────────────────────────────────

/// What both stores persist per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DocumentRecord {
    pub id: String,
    pub name: String,
    /// JSON array text
    pub elements: String,
    /// JSON object text
    pub app_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub version: u64,
    pub element_count: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentRecord {
    pub(crate) fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            name: name.into(),
            elements: "[]".to_string(),
            app_state: "{}".to_string(),
            preview: None,
            version: 1,
            element_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Write the present fields and bump the version.
    pub(crate) fn apply(&mut self, patch: DocumentPatch) -> Result<u64, StoreError> {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(elements) = patch.elements {
            self.elements = serde_json::to_string(&elements)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            self.element_count = elements.len() as u64;
        }
        if let Some(app_state) = patch.app_state {
            self.app_state = serde_json::to_string(&app_state)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
        }
        if let Some(preview) = patch.preview {
            self.preview = Some(preview);
        }
        self.version += 1;
        self.updated_at = now_millis().max(self.updated_at);
        Ok(self.version)
    }

    pub(crate) fn duplicate(&self, id: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            name: format!("{} (Copy)", self.name),
            elements: self.elements.clone(),
            app_state: self.app_state.clone(),
            preview: None,
            version: 1,
            element_count: self.element_count,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn to_document(&self) -> Result<StoredDocument, StoreError> {
        let elements: Vec<Element> = serde_json::from_str(&self.elements)
            .map_err(|e| StoreError::Deserialization(format!("elements of {}: {e}", self.id)))?;
        // A non-object app state (e.g. `null` from an old row) loads as empty.
        let app_state = match serde_json::from_str::<Value>(&self.app_state) {
            Ok(Value::Object(map)) => AppState(map),
            Ok(_) => AppState::default(),
            Err(e) => {
                return Err(StoreError::Deserialization(format!(
                    "app state of {}: {e}",
                    self.id
                )))
            }
        };
        Ok(StoredDocument {
            id: self.id.clone(),
            name: self.name.clone(),
            elements,
            app_state,
            preview: self.preview.clone(),
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    pub(crate) fn metadata(&self) -> DocumentMetadata {
        DocumentMetadata {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version,
            element_count: self.element_count,
            has_preview: self.preview.is_some(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Most recently updated first; ties broken by id for a stable order.
pub(crate) fn sort_listing(listing: &mut [DocumentMetadata]) {
    listing.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
}
