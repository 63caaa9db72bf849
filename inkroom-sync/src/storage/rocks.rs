//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: document record as JSON (LZ4 compressed), preview excluded
//! - `previews`: rendered preview text (LZ4 compressed)
//! - `metadata`: listing entry (bincode)
//!
//! Keys are the document id bytes. Every mutation is one atomic write batch
//! across the column families it touches.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    sort_listing, DocumentMetadata, DocumentPatch, DocumentRecord, DocumentStore, StoreError,
    StoredDocument,
};

const CF_DOCUMENTS: &str = "documents";
const CF_PREVIEWS: &str = "previews";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_PREVIEWS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true, a save is reported only once durable)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("inkroom_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, no fsync).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl DocumentMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    /// Single-threaded column family handles; callers run on the blocking pool
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-modify-write cycles of `save`.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_PREVIEWS => {
                // Values are already LZ4 framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                // Small values, scanned for listings
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    // ─── Records ──────────────────────────────────────────────────────

    fn read_record(&self, id: &str) -> Result<DocumentRecord, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(cf, id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn read_preview(&self, id: &str) -> Result<Option<String>, StoreError> {
        let cf = self.cf(CF_PREVIEWS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))
            }
            None => Ok(None),
        }
    }

    /// Atomically write record and metadata, plus the preview when
    /// `write_preview` is set.
    fn write_record(&self, record: &DocumentRecord, write_preview: bool) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_previews = self.cf(CF_PREVIEWS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let body = DocumentRecord {
            preview: None,
            ..record.clone()
        };
        let json =
            serde_json::to_vec(&body).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let key = record.id.as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, key, lz4_flex::compress_prepend_size(&json));
        batch.put_cf(cf_meta, key, record.metadata().encode()?);
        if let Some(preview) = record.preview.as_ref().filter(|_| write_preview) {
            batch.put_cf(cf_previews, key, lz4_flex::compress_prepend_size(preview.as_bytes()));
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::Database("write lock poisoned".to_string()))
    }

    /// Load only the listing entry.
    pub fn load_metadata(&self, id: &str) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    pub fn document_exists(&self, id: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, id.as_bytes())?.is_some())
    }

    /// Create an empty document under a caller-chosen id.
    pub fn create_with_id(&self, id: &str, name: &str) -> Result<StoredDocument, StoreError> {
        let _guard = self.locked()?;
        let record = DocumentRecord::new(id, name);
        self.write_record(&record, false)?;
        record.to_document()
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn load(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let mut record = self.read_record(id)?;
        record.preview = self.read_preview(id)?;
        record.to_document()
    }

    fn save(&self, id: &str, patch: DocumentPatch) -> Result<u64, StoreError> {
        let _guard = self.locked()?;
        let mut record = self.read_record(id)?;
        record.preview = self.read_preview(id)?;
        let preview_changed = patch.preview.is_some();
        let version = record.apply(patch)?;
        self.write_record(&record, preview_changed)?;
        log::debug!("Saved document {id} at version {version}");
        Ok(version)
    }

    fn create(&self, name: &str) -> Result<StoredDocument, StoreError> {
        self.create_with_id(&Uuid::new_v4().to_string(), name)
    }

    fn duplicate(&self, id: &str) -> Result<StoredDocument, StoreError> {
        let _guard = self.locked()?;
        let copy = self.read_record(id)?.duplicate(Uuid::new_v4().to_string());
        self.write_record(&copy, false)?;
        copy.to_document()
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let _guard = self.locked()?;
        if !self.document_exists(id)? {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let key = id.as_bytes();
        let mut batch = WriteBatch::default();
        for name in COLUMN_FAMILIES {
            batch.delete_cf(self.cf(name)?, key);
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut listing = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            listing.push(DocumentMetadata::decode(&value)?);
        }
        sort_listing(&mut listing);
        Ok(listing)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
