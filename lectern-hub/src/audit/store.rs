//! RocksDB-backed audit log.
//!
//! Column families:
//! - `events`: audit records (JSON), keyed by `session_id:8 BE ++ sequence:8 BE`
//!   so one session's history is a contiguous, ordered key range
//! - `sessions`: per-session metadata (bincode), keyed by `session_id:8 BE`
//!
//! Writes go through a single background task (see [`super::QueuedRecorder`]);
//! reads serve the request layer's history and summary queries.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{AuditEvent, AuditRecord, AuditSink};
use crate::protocol::SessionId;

const CF_EVENTS: &str = "events";
const CF_SESSIONS: &str = "sessions";

const COLUMN_FAMILIES: &[&str] = &[CF_EVENTS, CF_SESSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lectern_audit"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, caller-provided directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Per-session rollup kept next to the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: SessionId,
    pub event_count: u64,
    pub first_event_at: u64,
    pub last_event_at: u64,
    /// A `session_ended` event has been recorded.
    pub ended: bool,
}

impl SessionMetadata {
    fn new(session_id: SessionId, at: u64) -> Self {
        Self {
            session_id,
            event_count: 0,
            first_event_at: at,
            last_event_at: at,
            ended: false,
        }
    }

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

/// Per-type event counts for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditSummary {
    pub session_id: SessionId,
    pub total_events: u64,
    pub event_counts: BTreeMap<AuditEvent, u64>,
    pub metadata: Option<SessionMetadata>,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable, append-only audit log.
pub struct AuditStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next event sequence number (global across sessions)
    sequence: AtomicU64,
    /// Serializes the metadata read-modify-write in `append`
    metadata_guard: Mutex<()>,
}

impl AuditStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let sequence = Self::recover_sequence(&db)?;
        log::info!(
            "Opened audit store at {} (next sequence {sequence})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            sequence: AtomicU64::new(sequence),
            metadata_guard: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);

        match name {
            CF_EVENTS => {
                // Append-heavy, range-scanned by session prefix
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(8));
            }
            CF_SESSIONS => {
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// The highest stored sequence number + 1.
    ///
    /// Event keys are ordered by session first, so every key is inspected.
    fn recover_sequence(db: &DBWithThreadMode<SingleThreaded>) -> Result<u64, StoreError> {
        let cf = match db.cf_handle(CF_EVENTS) {
            Some(cf) => cf,
            None => return Ok(0),
        };
        let mut next = 0u64;
        for item in db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if let Some((_, seq)) = Self::split_key(&key) {
                next = next.max(seq + 1);
            }
        }
        Ok(next)
    }

    /// Append one record. Returns its sequence number.
    pub fn append(&self, record: &AuditRecord) -> Result<u64, StoreError> {
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_sessions = self.cf(CF_SESSIONS)?;

        let value =
            serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let _guard = match self.metadata_guard.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut meta = self
            .metadata(record.session_id)?
            .unwrap_or_else(|| SessionMetadata::new(record.session_id, record.recorded_at));
        meta.event_count += 1;
        meta.first_event_at = meta.first_event_at.min(record.recorded_at);
        meta.last_event_at = meta.last_event_at.max(record.recorded_at);
        if record.event_type == AuditEvent::SessionEnded {
            meta.ended = true;
        }

        // Atomic batch write: event + metadata
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_events, Self::event_key(record.session_id, seq), &value);
        batch.put_cf(cf_sessions, record.session_id.to_be_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(seq)
    }

    /// A session's records in append order, optionally filtered by type.
    pub fn events(
        &self,
        session_id: SessionId,
        filter: Option<AuditEvent>,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let start_key = Self::event_key(session_id, 0);
        let prefix = session_id.to_be_bytes();

        let mut records = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start_key, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            // Stop once past this session's key range
            if key.len() != 16 || key[..8] != prefix {
                break;
            }
            let record: AuditRecord = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            if filter.map_or(true, |f| f == record.event_type) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn metadata(&self, session_id: SessionId) -> Result<Option<SessionMetadata>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(cf, session_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(SessionMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Event counts per type for one session.
    pub fn summary(&self, session_id: SessionId) -> Result<AuditSummary, StoreError> {
        let mut event_counts = BTreeMap::new();
        let records = self.events(session_id, None)?;
        for record in &records {
            *event_counts.entry(record.event_type).or_insert(0) += 1;
        }
        Ok(AuditSummary {
            session_id,
            total_events: records.len() as u64,
            event_counts,
            metadata: self.metadata(session_id)?,
        })
    }

    /// Metadata of every session with at least one record.
    pub fn sessions(&self) -> Result<Vec<SessionMetadata>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            sessions.push(SessionMetadata::decode(&value)?);
        }
        Ok(sessions)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn event_key(session_id: SessionId, seq: u64) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&session_id.to_be_bytes());
        key[8..].copy_from_slice(&seq.to_be_bytes());
        key
    }

    fn split_key(key: &[u8]) -> Option<(SessionId, u64)> {
        if key.len() != 16 {
            return None;
        }
        let mut session = [0u8; 8];
        let mut seq = [0u8; 8];
        session.copy_from_slice(&key[..8]);
        seq.copy_from_slice(&key[8..]);
        Some((u64::from_be_bytes(session), u64::from_be_bytes(seq)))
    }
}

impl AuditSink for AuditStore {
    fn write(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.append(record).map(|_| ())
    }
}
