//! In-process document store.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use super::{
    sort_listing, DocumentMetadata, DocumentPatch, DocumentRecord, DocumentStore, StoreError,
    StoredDocument,
};

/// Document store kept in a map. Useful for tests and single-process setups.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DocumentRecord>>,
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Database("memory store lock poisoned".to_string())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty document under a caller-chosen id.
    pub fn create_with_id(&self, id: &str, name: &str) -> Result<StoredDocument, StoreError> {
        let record = DocumentRecord::new(id, name);
        let document = record.to_document()?;
        self.records
            .write()
            .map_err(poisoned)?
            .insert(id.to_string(), record);
        Ok(document)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn load(&self, id: &str) -> Result<StoredDocument, StoreError> {
        self.records
            .read()
            .map_err(poisoned)?
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .to_document()
    }

    fn save(&self, id: &str, patch: DocumentPatch) -> Result<u64, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.apply(patch)
    }

    fn create(&self, name: &str) -> Result<StoredDocument, StoreError> {
        self.create_with_id(&Uuid::new_v4().to_string(), name)
    }

    fn duplicate(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let copy = records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?
            .duplicate(Uuid::new_v4().to_string());
        let document = copy.to_document()?;
        records.insert(copy.id.clone(), copy);
        Ok(document)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.records
            .write()
            .map_err(poisoned)?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<DocumentMetadata>, StoreError> {
        let mut listing: Vec<DocumentMetadata> = self
            .records
            .read()
            .map_err(poisoned)?
            .values()
            .map(DocumentRecord::metadata)
            .collect();
        sort_listing(&mut listing);
        Ok(listing)
    }
}
