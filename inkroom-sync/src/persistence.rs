//! Durable save and preview tiers.
//!
//! The session decides *when* to persist (debounce timers in
//! [`SessionState`](crate::session::SessionState)); this module decides
//! *how*. Every store call runs on the blocking pool and reports back as a
//! [`PersistOutcome`] on a channel the session selects over, so a slow disk
//! never holds up real-time delivery.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::element::{AppState, Element};
use crate::storage::{DocumentPatch, DocumentStore, StoreError, StoredDocument};

/// Scene content captured at one point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub elements: Vec<Element>,
    pub app_state: AppState,
}

/// Preview rendering errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PreviewError {
    #[error("Preview rendering failed: {0}")]
    Render(String),
    #[error("Preview persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// Turns a scene into a preview payload. The format is up to the renderer.
pub trait PreviewRenderer: Send + Sync {
    /// `app_state` is already prepared for export.
    fn render(&self, elements: &[Element], app_state: &AppState) -> Result<String, PreviewError>;
}

/// Renders the live (non-deleted) elements and export state as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPreviewRenderer;

impl PreviewRenderer for JsonPreviewRenderer {
    fn render(&self, elements: &[Element], app_state: &AppState) -> Result<String, PreviewError> {
        let live: Vec<&Element> = elements.iter().filter(|e| !e.is_deleted).collect();
        serde_json::to_string(&serde_json::json!({
            "type": "preview",
            "elements": live,
            "appState": app_state,
        }))
        .map_err(|e| PreviewError::Render(e.to_string()))
    }
}

/// Result of one persistence job.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    /// Debounced save went through.
    Saved { document_id: String, version: u64 },
    /// A save failed, debounced or manual.
    SaveFailed { document_id: String, error: StoreError },
    PreviewSaved { document_id: String, version: u64 },
    PreviewFailed { document_id: String, error: PreviewError },
    /// Manual save went through; its preview follows separately.
    ManualSaved { document_id: String, version: u64 },
    Renamed { document_id: String, name: String, version: u64 },
    RenameFailed { document_id: String, error: StoreError },
}

impl PersistOutcome {
    pub fn document_id(&self) -> &str {
        match self {
            PersistOutcome::Saved { document_id, .. }
            | PersistOutcome::SaveFailed { document_id, .. }
            | PersistOutcome::PreviewSaved { document_id, .. }
            | PersistOutcome::PreviewFailed { document_id, .. }
            | PersistOutcome::ManualSaved { document_id, .. }
            | PersistOutcome::Renamed { document_id, .. }
            | PersistOutcome::RenameFailed { document_id, .. } => document_id,
        }
    }
}

/// Spawns store work and reports outcomes.
#[derive(Clone)]
pub struct PersistencePipeline {
    store: Arc<dyn DocumentStore>,
    renderer: Arc<dyn PreviewRenderer>,
    outcome_tx: mpsc::UnboundedSender<PersistOutcome>,
}

impl PersistencePipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        renderer: Arc<dyn PreviewRenderer>,
    ) -> (Self, mpsc::UnboundedReceiver<PersistOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        (
            Self {
                store,
                renderer,
                outcome_tx,
            },
            outcome_rx,
        )
    }

    /// Load a document for hydration.
    pub async fn load(&self, document_id: &str) -> Result<StoredDocument, StoreError> {
        let store = self.store.clone();
        let id = document_id.to_string();
        blocking(move || store.load(&id)).await
    }

    /// Debounced save of elements and the persistable app-state subset.
    pub fn spawn_save(&self, document_id: impl Into<String>, snapshot: Snapshot) -> JoinHandle<()> {
        let this = self.clone();
        let document_id = document_id.into();
        tokio::spawn(async move {
            let outcome = match this.save(&document_id, snapshot).await {
                Ok(version) => PersistOutcome::Saved {
                    document_id,
                    version,
                },
                Err(error) => PersistOutcome::SaveFailed { document_id, error },
            };
            this.report(outcome);
        })
    }

    /// Debounced preview render and store.
    pub fn spawn_preview(
        &self,
        document_id: impl Into<String>,
        snapshot: Snapshot,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let document_id = document_id.into();
        tokio::spawn(async move {
            let outcome = this.preview_outcome(document_id, snapshot).await;
            this.report(outcome);
        })
    }

    /// Immediate save followed by an immediate preview. Pending debounced
    /// work is left alone.
    pub fn spawn_save_now(
        &self,
        document_id: impl Into<String>,
        snapshot: Snapshot,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let document_id = document_id.into();
        tokio::spawn(async move {
            match this.save(&document_id, snapshot.clone()).await {
                Ok(version) => this.report(PersistOutcome::ManualSaved {
                    document_id: document_id.clone(),
                    version,
                }),
                Err(error) => {
                    this.report(PersistOutcome::SaveFailed { document_id, error });
                    return;
                }
            }
            let outcome = this.preview_outcome(document_id, snapshot).await;
            this.report(outcome);
        })
    }

    /// Persist a new name only.
    pub fn spawn_rename(
        &self,
        document_id: impl Into<String>,
        name: impl Into<String>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let document_id = document_id.into();
        let name = name.into();
        tokio::spawn(async move {
            let store = this.store.clone();
            let (id, new_name) = (document_id.clone(), name.clone());
            let outcome =
                match blocking(move || store.save(&id, DocumentPatch::rename(new_name))).await {
                    Ok(version) => PersistOutcome::Renamed {
                        document_id,
                        name,
                        version,
                    },
                    Err(error) => PersistOutcome::RenameFailed { document_id, error },
                };
            this.report(outcome);
        })
    }

    async fn save(&self, document_id: &str, snapshot: Snapshot) -> Result<u64, StoreError> {
        let store = self.store.clone();
        let id = document_id.to_string();
        let patch = DocumentPatch::content(snapshot.elements, snapshot.app_state.persistable());
        blocking(move || store.save(&id, patch)).await
    }

    async fn preview_outcome(&self, document_id: String, snapshot: Snapshot) -> PersistOutcome {
        let store = self.store.clone();
        let renderer = self.renderer.clone();
        let id = document_id.clone();
        let result = tokio::task::spawn_blocking(move || {
            let preview = renderer.render(&snapshot.elements, &snapshot.app_state.for_export())?;
            Ok::<_, PreviewError>(store.save(&id, DocumentPatch::preview(preview))?)
        })
        .await
        .map_err(|e| PreviewError::Store(StoreError::Task(e.to_string())))
        .and_then(|r| r);

        match result {
            Ok(version) => PersistOutcome::PreviewSaved {
                document_id,
                version,
            },
            Err(error) => PersistOutcome::PreviewFailed { document_id, error },
        }
    }

    fn report(&self, outcome: PersistOutcome) {
        match &outcome {
            PersistOutcome::SaveFailed { document_id, error }
            | PersistOutcome::RenameFailed { document_id, error } => {
                log::error!("Persisting {document_id} failed: {error}")
            }
            PersistOutcome::PreviewFailed { document_id, error } => {
                log::warn!("Preview for {document_id} failed: {error}")
            }
            other => log::debug!("Persisted {other:?}"),
        }
        // Session gone means nobody is listening; the work itself is done.
        let _ = self.outcome_tx.send(outcome);
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    struct FailingRenderer;

    impl PreviewRenderer for FailingRenderer {
        fn render(&self, _: &[Element], _: &AppState) -> Result<String, PreviewError> {
            Err(PreviewError::Render("no canvas".into()))
        }
    }

    fn snapshot() -> Snapshot {
        let mut app_state = AppState::new();
        app_state.set(AppState::BACKGROUND, "#123456");
        app_state.set("zoom", 2.0);
        Snapshot {
            elements: vec![
                Element::new("a", 1, 1, 0.0).with_attribute("type", "ellipse"),
                Element::new("b", 2, 2, 0.0).deleted(),
            ],
            app_state,
        }
    }

    fn pipeline_with(
        renderer: Arc<dyn PreviewRenderer>,
    ) -> (
        Arc<MemoryStore>,
        PersistencePipeline,
        mpsc::UnboundedReceiver<PersistOutcome>,
    ) {
        let store = Arc::new(MemoryStore::new());
        store.create_with_id("d1", "Board").unwrap();
        let (pipeline, rx) = PersistencePipeline::new(store.clone(), renderer);
        (store, pipeline, rx)
    }

    #[tokio::test]
    async fn test_save_persists_app_state_subset() {
        let (store, pipeline, mut rx) = pipeline_with(Arc::new(JsonPreviewRenderer));
        pipeline.spawn_save("d1", snapshot()).await.unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            PersistOutcome::Saved {
                document_id: "d1".into(),
                version: 2
            }
        );
        let doc = store.load("d1").unwrap();
        assert_eq!(doc.elements.len(), 2);
        assert_eq!(
            doc.app_state.get(AppState::BACKGROUND),
            Some(&serde_json::json!("#123456"))
        );
        assert!(doc.app_state.get("zoom").is_none());
    }

    #[tokio::test]
    async fn test_save_failure_reported() {
        let (_store, pipeline, mut rx) = pipeline_with(Arc::new(JsonPreviewRenderer));
        pipeline.spawn_save("missing", snapshot()).await.unwrap();
        match rx.recv().await.unwrap() {
            PersistOutcome::SaveFailed { document_id, error } => {
                assert_eq!(document_id, "missing");
                assert_eq!(error, StoreError::NotFound("missing".into()));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_preview_only_touches_preview() {
        let (store, pipeline, mut rx) = pipeline_with(Arc::new(JsonPreviewRenderer));
        pipeline.spawn_preview("d1", snapshot()).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            PersistOutcome::PreviewSaved { version: 2, .. }
        ));
        let doc = store.load("d1").unwrap();
        assert!(doc.elements.is_empty());
        let preview: serde_json::Value =
            serde_json::from_str(doc.preview.as_deref().unwrap()).unwrap();
        assert_eq!(preview["elements"].as_array().unwrap().len(), 1);
        assert_eq!(preview["appState"]["exportBackground"], true);
    }

    #[tokio::test]
    async fn test_preview_failure_leaves_document() {
        let (store, pipeline, mut rx) = pipeline_with(Arc::new(FailingRenderer));
        pipeline.spawn_preview("d1", snapshot()).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            PersistOutcome::PreviewFailed {
                error: PreviewError::Render(_),
                ..
            }
        ));
        assert_eq!(store.load("d1").unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_save_now_saves_then_previews() {
        let (store, pipeline, mut rx) = pipeline_with(Arc::new(JsonPreviewRenderer));
        pipeline.spawn_save_now("d1", snapshot()).await.unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            PersistOutcome::ManualSaved { version: 2, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            PersistOutcome::PreviewSaved { version: 3, .. }
        ));
        let doc = store.load("d1").unwrap();
        assert_eq!(doc.elements.len(), 2);
        assert!(doc.preview.is_some());
    }

    #[tokio::test]
    async fn test_rename_and_load() {
        let (_store, pipeline, mut rx) = pipeline_with(Arc::new(JsonPreviewRenderer));
        pipeline.spawn_rename("d1", "Roadmap").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            PersistOutcome::Renamed {
                document_id: "d1".into(),
                name: "Roadmap".into(),
                version: 2
            }
        );
        assert_eq!(pipeline.load("d1").await.unwrap().name, "Roadmap");
        assert!(pipeline.load("nope").await.is_err());
    }
}
