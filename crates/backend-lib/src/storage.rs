// ============================
// crates/backend-lib/src/storage.rs
// ============================
//! Document store abstraction with in-memory and flat-file implementations.
//!
//! Documents are JSON objects addressed by slash-separated paths that
//! alternate collection and document ids (`users/<uid>`,
//! `screeningQuestions/<ageGroup>/questions/<id>`).
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{
    fs as tokio_fs,
    sync::{Mutex, OwnedMutexGuard},
};
use uuid::Uuid;

/// A stored document
pub type Document = Map<String, Value>;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("invalid document path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// How `set` combines new fields with an existing document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Replace the whole document
    Overwrite,
    /// Replace only the given top-level fields, keep the rest
    MergeAll,
}

/// Outcome requested by a transaction body
#[derive(Debug, Clone, PartialEq)]
pub enum TxDecision {
    /// Merge these fields into the document (creating it if missing)
    Commit(Document),
    /// Leave the document untouched
    Abort,
}

/// Read-modify-write body of a transaction
pub type TxFn = Box<dyn FnOnce(Option<&Document>) -> TxDecision + Send>;

/// Trait for document store backends
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` if it does not exist
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError>;

    /// Write a document
    async fn set(&self, path: &str, fields: Document, mode: SetMode) -> Result<(), StoreError>;

    /// Create a document with a generated id inside `collection`; returns the id
    async fn add(&self, collection: &str, fields: Document) -> Result<String, StoreError>;

    /// Every direct child document of `collection` as `(id, document)`
    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError>;

    /// Delete a document; deleting a missing document is not an error
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Atomically read `path`, let `body` decide, and apply its decision.
    ///
    /// No other write to `path` can interleave between the read and the
    /// write. Returns whether the body committed.
    async fn transaction(&self, path: &str, body: TxFn) -> Result<bool, StoreError>;

    /// Timestamp assigned by the store
    fn server_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

fn merge_into(target: &mut Document, fields: Document) {
    for (key, value) in fields {
        target.insert(key, value);
    }
}

/// Document paths have an even number of non-empty segments
fn validate_document_path(path: &str) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() % 2 != 0 || segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Collection paths have an odd number of non-empty segments
fn validate_collection_path(path: &str) -> Result<(), StoreError> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() % 2 != 1 || segments.iter().any(|s| s.is_empty() || *s == "." || *s == "..") {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn new_document_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// In-memory implementation, for tests and local development
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    docs: Arc<DashMap<String, Document>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        validate_document_path(path)?;
        Ok(self.docs.get(path).map(|doc| doc.clone()))
    }

    async fn set(&self, path: &str, fields: Document, mode: SetMode) -> Result<(), StoreError> {
        validate_document_path(path)?;
        match mode {
            SetMode::Overwrite => {
                self.docs.insert(path.to_string(), fields);
            },
            SetMode::MergeAll => {
                let mut doc = self.docs.entry(path.to_string()).or_default();
                merge_into(&mut doc, fields);
            },
        }
        Ok(())
    }

    async fn add(&self, collection: &str, fields: Document) -> Result<String, StoreError> {
        validate_collection_path(collection)?;
        let id = new_document_id();
        self.docs.insert(format!("{collection}/{id}"), fields);
        Ok(id)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        validate_collection_path(collection)?;
        let prefix = format!("{collection}/");
        let mut children: Vec<(String, Document)> = self
            .docs
            .iter()
            .filter_map(|entry| {
                let id = entry.key().strip_prefix(&prefix)?;
                (!id.contains('/')).then(|| (id.to_string(), entry.value().clone()))
            })
            .collect();
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        validate_document_path(path)?;
        self.docs.remove(path);
        Ok(())
    }

    async fn transaction(&self, path: &str, body: TxFn) -> Result<bool, StoreError> {
        validate_document_path(path)?;

        // The entry guard holds the shard write lock for the whole body
        match self.docs.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => match body(Some(occupied.get())) {
                TxDecision::Commit(fields) => {
                    merge_into(occupied.get_mut(), fields);
                    Ok(true)
                },
                TxDecision::Abort => Ok(false),
            },
            dashmap::mapref::entry::Entry::Vacant(vacant) => match body(None) {
                TxDecision::Commit(fields) => {
                    vacant.insert(fields);
                    Ok(true)
                },
                TxDecision::Abort => Ok(false),
            },
        }
    }
}

type PathLocks = DashMap<String, Arc<Mutex<()>>>;

/// Held write lock on one document path. Dropping it releases the lock and
/// forgets the path once nobody else holds or waits for it.
struct PathGuard {
    locks: Arc<PathLocks>,
    path: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Waiters hold their own clone, so only the map's reference is left
        // when the path is idle
        self.locks.remove_if(&self.path, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Flat-file implementation: one pretty-printed JSON file per document.
///
/// `users/u1` lives at `<root>/users/u1.json`; its subcollections live under
/// `<root>/users/u1/`. Writes to one path are serialised by a per-path lock.
#[derive(Clone)]
pub struct FlatFileDocumentStore {
    root: PathBuf,
    locks: Arc<PathLocks>,
}

impl FlatFileDocumentStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Arc::new(DashMap::new()),
        })
    }

    fn file_for(&self, path: &str) -> PathBuf {
        self.root.join(format!("{path}.json"))
    }

    async fn lock_path(&self, path: &str) -> PathGuard {
        let lock = self
            .locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        PathGuard {
            locks: self.locks.clone(),
            path: path.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of paths with a live write lock
    pub fn locked_paths(&self) -> usize {
        self.locks.len()
    }

    async fn read(&self, path: &str) -> Result<Option<Document>, StoreError> {
        let file = self.file_for(path);
        match tokio_fs::read_to_string(&file).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file and rename, so readers never see a
    /// half-written document
    async fn write(&self, path: &str, doc: &Document) -> Result<(), StoreError> {
        let file = self.file_for(path);
        if let Some(parent) = file.parent() {
            tokio_fs::create_dir_all(parent).await?;
        }

        let tmp = file.with_extension(format!("json.{}.tmp", new_document_id()));
        let json = serde_json::to_string_pretty(doc)?;
        tokio_fs::write(&tmp, json).await?;
        tokio_fs::rename(&tmp, &file).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for FlatFileDocumentStore {
    async fn get(&self, path: &str) -> Result<Option<Document>, StoreError> {
        validate_document_path(path)?;
        self.read(path).await
    }

    async fn set(&self, path: &str, fields: Document, mode: SetMode) -> Result<(), StoreError> {
        validate_document_path(path)?;
        let _guard = self.lock_path(path).await;

        let doc = match mode {
            SetMode::Overwrite => fields,
            SetMode::MergeAll => {
                let mut doc = self.read(path).await?.unwrap_or_default();
                merge_into(&mut doc, fields);
                doc
            },
        };
        self.write(path, &doc).await
    }

    async fn add(&self, collection: &str, fields: Document) -> Result<String, StoreError> {
        validate_collection_path(collection)?;
        let id = new_document_id();
        self.write(&format!("{collection}/{id}"), &fields).await?;
        Ok(id)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        validate_collection_path(collection)?;
        let dir = self.root.join(collection);

        let mut entries = match tokio_fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let content = tokio_fs::read_to_string(entry.path()).await?;
            children.push((id.to_string(), serde_json::from_str(&content)?));
        }
        children.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(children)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        validate_document_path(path)?;
        let _guard = self.lock_path(path).await;

        match tokio_fs::remove_file(self.file_for(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn transaction(&self, path: &str, body: TxFn) -> Result<bool, StoreError> {
        validate_document_path(path)?;
        let _guard = self.lock_path(path).await;

        let current = self.read(path).await?;
        match body(current.as_ref()) {
            TxDecision::Commit(fields) => {
                let mut doc = current.unwrap_or_default();
                merge_into(&mut doc, fields);
                self.write(path, &doc).await?;
                Ok(true)
            },
            TxDecision::Abort => Ok(false),
        }
    }
}
