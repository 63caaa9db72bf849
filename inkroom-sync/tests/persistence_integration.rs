//! Integration tests for the persistence tiers on a RocksDB store.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use inkroom_sync::element::{AppState, Element};
use inkroom_sync::persistence::{JsonPreviewRenderer, PersistOutcome, PersistencePipeline, Snapshot};
use inkroom_sync::presence::Collaborator;
use inkroom_sync::session::{Notice, SessionConfig, Surface, SurfaceEvent, SyncSession};
use inkroom_sync::participant::ParticipantIdentity;
use inkroom_sync::storage::{DocumentStore, RocksStore, StoreConfig};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

// Nothing listens on port 1: sessions run offline against local storage.
const OFFLINE: &str = "ws://127.0.0.1:1";

fn open_store(dir: &tempfile::TempDir) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap())
}

fn shape(id: &str, version: u64) -> Element {
    Element::new(id, version, version as i64 * 7, 1_700_000_000_000.0)
        .with_attribute("type", "diamond")
        .with_attribute("strokeColor", "#1e1e1e")
}

#[tokio::test]
async fn test_pipeline_round_trip_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let doc_id = {
        let store = open_store(&dir);
        let doc = store.create("Roadmap").unwrap();
        let (pipeline, mut outcomes) =
            PersistencePipeline::new(store.clone(), Arc::new(JsonPreviewRenderer));

        let mut app_state = AppState::new();
        app_state.set(AppState::GRID_SIZE, 20);
        app_state.set("scrollX", 300);
        pipeline
            .spawn_save_now(
                doc.id.clone(),
                Snapshot {
                    elements: vec![shape("s1", 1), shape("s2", 4).deleted()],
                    app_state,
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            outcomes.recv().await.unwrap(),
            PersistOutcome::ManualSaved { version: 2, .. }
        ));
        assert!(matches!(
            outcomes.recv().await.unwrap(),
            PersistOutcome::PreviewSaved { version: 3, .. }
        ));
        store.flush().unwrap();
        doc.id
    };

    let store = open_store(&dir);
    let doc = store.load(&doc_id).unwrap();
    assert_eq!(doc.name, "Roadmap");
    assert_eq!(doc.version, 3);
    assert_eq!(doc.elements.len(), 2);
    assert!(doc.elements[1].is_deleted);
    assert_eq!(doc.app_state.get(AppState::GRID_SIZE), Some(&serde_json::json!(20)));
    assert!(doc.app_state.get("scrollX").is_none());
    assert!(doc.preview.is_some());

    let listing = store.list().unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].element_count, 2);
    assert!(listing[0].has_preview);
}

#[derive(Clone, Default)]
struct RecordingSurface {
    notices: Arc<Mutex<Vec<Notice>>>,
    elements: Vec<Element>,
}

impl Surface for RecordingSurface {
    fn scene_elements(&self) -> Vec<Element> {
        self.elements.clone()
    }

    fn selected_element_ids(&self) -> HashSet<String> {
        HashSet::new()
    }

    fn load_scene(&mut self, elements: Vec<Element>, _app_state: AppState) {
        self.elements = elements;
    }

    fn replace_elements(&mut self, elements: Vec<Element>) {
        self.elements = elements;
    }

    fn update_collaborators(&mut self, _collaborators: Vec<Collaborator>) {}

    fn remove_collaborators(&mut self, _ids: &[String]) {}

    fn notify(&mut self, notice: Notice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push(notice);
        }
    }
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        save_debounce: Duration::from_millis(20),
        preview_debounce: Duration::from_millis(60),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn test_session_debounced_save_and_preview() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let doc = store.create("Sketch").unwrap();

    let surface = RecordingSurface::default();
    let notices = surface.notices.clone();
    let session = SyncSession::new(
        ParticipantIdentity::with_id("me", "Me"),
        OFFLINE,
        surface,
        store.clone(),
        Arc::new(JsonPreviewRenderer),
        fast_config(),
    );
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(session.run(rx));

    tx.send(SurfaceEvent::OpenDocument(doc.id.clone())).await.unwrap();
    for version in 1..=3 {
        tx.send(SurfaceEvent::SceneChanged {
            elements: vec![shape("s1", version)],
            app_state: AppState::new(),
        })
        .await
        .unwrap();
    }

    // Save and preview land once the debounces go quiet.
    timeout(Duration::from_secs(5), async {
        loop {
            let current = store.load(&doc.id).unwrap();
            if current.preview.is_some() && current.elements.first().map(|e| e.version) == Some(3) {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("debounced save and preview never landed");

    tx.send(SurfaceEvent::Rename("Final sketch".into())).await.unwrap();
    timeout(Duration::from_secs(5), async {
        while store.load(&doc.id).unwrap().name != "Final sketch" {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("rename never landed");

    tx.send(SurfaceEvent::Close).await.unwrap();
    handle.await.unwrap();

    // Background saves report nothing to the user.
    assert!(notices.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_session_save_now_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let doc = store.create("Sketch").unwrap();

    let surface = RecordingSurface::default();
    let notices = surface.notices.clone();
    let session = SyncSession::new(
        ParticipantIdentity::with_id("me", "Me"),
        OFFLINE,
        surface,
        store.clone(),
        Arc::new(JsonPreviewRenderer),
        SessionConfig::default(),
    );
    let (tx, rx) = mpsc::channel(16);
    let handle = tokio::spawn(session.run(rx));

    tx.send(SurfaceEvent::OpenDocument(doc.id.clone())).await.unwrap();
    tx.send(SurfaceEvent::SaveNow).await.unwrap();

    timeout(Duration::from_secs(5), async {
        while !notices.lock().unwrap().contains(&Notice::Saved) {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("manual save was never confirmed");

    tx.send(SurfaceEvent::Close).await.unwrap();
    handle.await.unwrap();
    assert_eq!(Notice::Saved.message(), "Saved changes to server");
}
