//! RocksDB-backed manuscript store.
//!
//! Column families:
//! - `documents`: one record per manuscript: base content (LZ4) at the base version
//! - `edits`:     committed edits after the base, keyed by manuscript:version
//! - `snapshots`: version snapshots (LZ4), keyed by manuscript:version
//! - `comments`:  comment records, keyed by manuscript:comment id
//!
//! Keys start with a length-prefixed manuscript id so each manuscript's
//! records form one contiguous, ordered range.

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::{
    decode_record, encode_record, replay_stored, DocumentStore, ManuscriptMeta, StoreError,
    StoredManuscript,
};
use crate::comments::Comment;
use crate::ids::ManuscriptId;
use crate::operation::CollaborativeEdit;
use crate::versions::VersionSnapshot;

const CF_DOCUMENTS: &str = "documents";
const CF_EDITS: &str = "edits";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_COMMENTS: &str = "comments";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_EDITS, CF_SNAPSHOTS, CF_COMMENTS];

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes
    pub block_cache_size: usize,
    pub bloom_filter_bits: i32,
    /// fsync every write batch
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("manuscript_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
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

/// Per-manuscript record in the `documents` column family.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentRecord {
    manuscript_id: ManuscriptId,
    /// LZ4-compressed content at `base_version`.
    base_content: Vec<u8>,
    base_version: u64,
    head_version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    fn content(&self) -> Result<String, StoreError> {
        let bytes = lz4_flex::decompress_size_prepended(&self.base_content)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn meta(&self) -> ManuscriptMeta {
        ManuscriptMeta {
            manuscript_id: self.manuscript_id.clone(),
            version: self.head_version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
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
        log::info!("Opened manuscript store at {}", config.path.display());
        Ok(Self { db, config })
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
            CF_DOCUMENTS => {
                // Content is already LZ4-compressed by us.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_EDITS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            CF_SNAPSHOTS => {
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
        }
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of edits stored after the base content.
    pub fn pending_edits(&self, id: &ManuscriptId) -> Result<usize, StoreError> {
        let cf = self.cf(CF_EDITS)?;
        let scope = scope_key(id);
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::From(&scope, Direction::Forward)) {
            let (key, _) = item?;
            if !key.starts_with(&scope) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn load_record(&self, id: &ManuscriptId) -> Result<DocumentRecord, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, scope_key(id))? {
            Some(bytes) => decode_record(&bytes),
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    fn load_edits_after(
        &self,
        id: &ManuscriptId,
        after: u64,
    ) -> Result<Vec<CollaborativeEdit>, StoreError> {
        let cf = self.cf(CF_EDITS)?;
        let scope = scope_key(id);
        let start = versioned_key(id, after + 1);

        let mut edits = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&scope) {
                break;
            }
            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            edits.push(decode_record(&bytes)?);
        }
        Ok(edits)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentStore for RocksStore {
    fn load_document(&self, id: &ManuscriptId) -> Result<StoredManuscript, StoreError> {
        let record = self.load_record(id)?;
        let edits = self.load_edits_after(id, record.base_version)?;
        let (content, version) = replay_stored(id, record.content()?, record.base_version, &edits)?;
        Ok(StoredManuscript {
            manuscript_id: id.clone(),
            content,
            version,
            created_at: record.created_at,
        })
    }

    fn create_document(
        &self,
        id: &ManuscriptId,
        content: &str,
    ) -> Result<StoredManuscript, StoreError> {
        match self.load_record(id) {
            Ok(_) => return Err(StoreError::AlreadyExists(id.clone())),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let now = Utc::now();
        let record = DocumentRecord {
            manuscript_id: id.clone(),
            base_content: lz4_flex::compress_prepend_size(content.as_bytes()),
            base_version: 0,
            head_version: 0,
            created_at: now,
            updated_at: now,
        };
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_DOCUMENTS)?, scope_key(id), encode_record(&record)?);
        self.write(batch)?;
        log::info!("Created manuscript {id} ({} chars)", content.chars().count());

        Ok(StoredManuscript {
            manuscript_id: id.clone(),
            content: content.to_string(),
            version: 0,
            created_at: now,
        })
    }

    fn persist_edit(&self, edit: &CollaborativeEdit) -> Result<(), StoreError> {
        self.persist_edits(std::slice::from_ref(edit))
    }

    /// One write batch for all edits plus the updated head version.
    fn persist_edits(&self, edits: &[CollaborativeEdit]) -> Result<(), StoreError> {
        self.persist_commit(edits, &[])
    }

    fn persist_commit(
        &self,
        edits: &[CollaborativeEdit],
        comments: &[Comment],
    ) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        if let Some(first) = edits.first() {
            let id = &first.manuscript_id;
            let mut record = self.load_record(id)?;
            let cf_edits = self.cf(CF_EDITS)?;
            for edit in edits {
                let expected = record.head_version + 1;
                if edit.version != expected {
                    return Err(StoreError::VersionMismatch {
                        manuscript_id: id.clone(),
                        expected,
                        got: edit.version,
                    });
                }
                let compressed = lz4_flex::compress_prepend_size(&encode_record(edit)?);
                batch.put_cf(cf_edits, versioned_key(id, edit.version), compressed);
                record.head_version = edit.version;
            }
            record.updated_at = Utc::now();
            batch.put_cf(self.cf(CF_DOCUMENTS)?, scope_key(id), encode_record(&record)?);
        }
        for comment in comments {
            batch.put_cf(self.cf(CF_COMMENTS)?, comment_key(comment), encode_record(comment)?);
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.write(batch)
    }

    /// Stores the snapshot and compacts the edits it covers into the base.
    fn persist_snapshot(&self, snapshot: &VersionSnapshot) -> Result<(), StoreError> {
        let id = &snapshot.manuscript_id;
        let mut record = self.load_record(id)?;
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let snapshot_key = versioned_key(id, snapshot.version);

        let mut batch = WriteBatch::default();
        if self.db.get_cf(cf_snapshots, &snapshot_key)?.is_none() {
            let compressed = lz4_flex::compress_prepend_size(&encode_record(snapshot)?);
            batch.put_cf(cf_snapshots, &snapshot_key, compressed);
        }

        if snapshot.version > record.base_version && snapshot.version <= record.head_version {
            let cf_edits = self.cf(CF_EDITS)?;
            let start = versioned_key(id, record.base_version + 1);
            let end = versioned_key(id, snapshot.version + 1);
            let mut compacted = 0u64;
            for item in self.db.iterator_cf(cf_edits, IteratorMode::From(&start, Direction::Forward)) {
                let (key, _) = item?;
                if key.as_ref() >= end.as_slice() {
                    break;
                }
                batch.delete_cf(cf_edits, &key);
                compacted += 1;
            }
            record.base_content = lz4_flex::compress_prepend_size(snapshot.content.as_bytes());
            record.base_version = snapshot.version;
            record.updated_at = Utc::now();
            batch.put_cf(self.cf(CF_DOCUMENTS)?, scope_key(id), encode_record(&record)?);
            log::debug!("Compacted {compacted} edits of {id} into v{}", snapshot.version);
        }

        self.write(batch)
    }

    fn persist_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_COMMENTS)?, comment_key(comment), encode_record(comment)?);
        self.write(batch)
    }

    fn load_comments(&self, id: &ManuscriptId) -> Result<Vec<Comment>, StoreError> {
        let cf = self.cf(CF_COMMENTS)?;
        let scope = scope_key(id);
        let mut comments = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&scope, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&scope) {
                break;
            }
            comments.push(decode_record(&value)?);
        }
        Ok(comments)
    }

    fn load_snapshots(&self, id: &ManuscriptId) -> Result<Vec<VersionSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let scope = scope_key(id);
        let mut snapshots = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&scope, Direction::Forward)) {
            let (key, value) = item?;
            if !key.starts_with(&scope) {
                break;
            }
            let bytes = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            snapshots.push(decode_record(&bytes)?);
        }
        Ok(snapshots)
    }

    fn list_documents(&self) -> Result<Vec<ManuscriptMeta>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut metas = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let record: DocumentRecord = decode_record(&value)?;
            metas.push(record.meta());
        }
        Ok(metas)
    }
}

/// `<id length: u32 BE><id bytes>`
fn scope_key(id: &ManuscriptId) -> Vec<u8> {
    let bytes = id.as_str().as_bytes();
    let mut key = Vec::with_capacity(4 + bytes.len() + 8);
    key.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    key.extend_from_slice(bytes);
    key
}

/// Scope key followed by the version, big-endian so keys sort by version.
fn versioned_key(id: &ManuscriptId, version: u64) -> Vec<u8> {
    let mut key = scope_key(id);
    key.extend_from_slice(&version.to_be_bytes());
    key
}

fn comment_key(comment: &Comment) -> Vec<u8> {
    let mut key = scope_key(&comment.manuscript_id);
    key.extend_from_slice(comment.id.0.as_bytes());
    key
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{SessionId, UserId};
    use crate::operation::EditOperation;

    fn open(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn edit(id: &ManuscriptId, op: EditOperation, version: u64) -> CollaborativeEdit {
        CollaborativeEdit::new(
            id.clone(),
            SessionId::new(),
            UserId::new("alice"),
            op,
            version - 1,
            version,
        )
    }

    fn snapshot(id: &ManuscriptId, version: u64, content: &str) -> VersionSnapshot {
        VersionSnapshot {
            manuscript_id: id.clone(),
            version,
            content: content.into(),
            changes: Vec::new(),
            author_id: UserId::new("alice"),
            description: None,
            parent_version: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = ManuscriptId::new("ms-1");
        store.create_document(&id, "Hello world").unwrap();

        let doc = store.load_document(&id).unwrap();
        assert_eq!(doc.content, "Hello world");
        assert_eq!(doc.version, 0);
        assert!(matches!(
            store.create_document(&id, "x"),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(matches!(
            store.load_document(&ManuscriptId::new("missing")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_edits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = ManuscriptId::new("ms-1");
        {
            let store = open(&dir);
            store.create_document(&id, "Hello world").unwrap();
            store.persist_edit(&edit(&id, EditOperation::insert(5, "! "), 1)).unwrap();
            store.persist_edit(&edit(&id, EditOperation::delete(8, 5), 2)).unwrap();
        }
        let store = open(&dir);
        let doc = store.load_document(&id).unwrap();
        assert_eq!(doc.content, "Hello!  ");
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn test_version_gap_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = ManuscriptId::new("ms-1");
        store.create_document(&id, "abc").unwrap();
        let err = store
            .persist_edits(&[
                edit(&id, EditOperation::insert(0, "x"), 1),
                edit(&id, EditOperation::insert(0, "y"), 3),
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { expected: 2, got: 3, .. }));
        assert_eq!(store.pending_edits(&id).unwrap(), 0);
        assert_eq!(store.load_document(&id).unwrap().version, 0);
    }

    #[test]
    fn test_snapshot_compacts_covered_edits() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = ManuscriptId::new("ms-1");
        store.create_document(&id, "a").unwrap();
        for v in 1..=4 {
            store.persist_edit(&edit(&id, EditOperation::insert(0, "x"), v)).unwrap();
        }

        store.persist_snapshot(&snapshot(&id, 3, "xxxa")).unwrap();
        assert_eq!(store.pending_edits(&id).unwrap(), 1);

        let doc = store.load_document(&id).unwrap();
        assert_eq!(doc.content, "xxxxa");
        assert_eq!(doc.version, 4);

        let snapshots = store.load_snapshots(&id).unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].version, 3);
    }

    #[test]
    fn test_comments_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = ManuscriptId::new("ms-1");
        store.create_document(&id, "text").unwrap();

        let mut comment = Comment::new(id.clone(), UserId::new("bob"), "Bob", "why?", 0, 4, Vec::new());
        store.persist_comment(&comment).unwrap();
        comment.content = "why though?".into();
        store.persist_comment(&comment).unwrap();

        let comments = store.load_comments(&id).unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].content, "why though?");
    }

    #[test]
    fn test_commit_stores_edits_and_anchors_together() {
        let dir = tempfile::tempdir().unwrap();
        let id = ManuscriptId::new("ms-1");
        let mut comment = Comment::new(id.clone(), UserId::new("bob"), "Bob", "why?", 0, 4, Vec::new());
        {
            let store = open(&dir);
            store.create_document(&id, "text").unwrap();
            store.persist_comment(&comment).unwrap();

            let mut first = edit(&id, EditOperation::insert(0, ">"), 1);
            first.applied = true;
            comment.anchor_position = 1;
            store.persist_commit(&[first], &[comment.clone()]).unwrap();

            // A rejected edit takes its anchor update down with it.
            comment.anchor_position = 9;
            let gap = edit(&id, EditOperation::insert(0, "x"), 5);
            assert!(store.persist_commit(&[gap], &[comment.clone()]).is_err());
        }

        let store = open(&dir);
        let stored = store.load_edits_after(&id, 0).unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].applied);
        assert_eq!(store.load_comments(&id).unwrap()[0].anchor_position, 1);
    }

    #[test]
    fn test_manuscripts_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let a = ManuscriptId::new("a");
        let ab = ManuscriptId::new("ab");
        store.create_document(&a, "first").unwrap();
        store.create_document(&ab, "second").unwrap();
        store.persist_edit(&edit(&a, EditOperation::insert(0, ">"), 1)).unwrap();

        assert_eq!(store.load_document(&a).unwrap().content, ">first");
        assert_eq!(store.load_document(&ab).unwrap().content, "second");
        assert_eq!(store.pending_edits(&ab).unwrap(), 0);

        let listed = store.list_documents().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|m| m.manuscript_id == a && m.version == 1));
    }

    #[test]
    fn test_multibyte_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = ManuscriptId::new("ms-ü");
        store.create_document(&id, "Grüße").unwrap();
        store.persist_edit(&edit(&id, EditOperation::insert(5, ", Welt"), 1)).unwrap();
        assert_eq!(store.load_document(&id).unwrap().content, "Grüße, Welt");
    }
}
