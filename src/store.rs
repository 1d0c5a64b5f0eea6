//! Metadata store contract
//!
//! The virtual filesystem's metadata lives in an external store; this
//! crate only consumes the narrow contract below. Mount items form a tree
//! under a fixed content root; identity is a deterministic UUIDv5 over
//! `(parent id, name)`, so re-ingesting the same NZB reproduces the same
//! ids.
//!
//! Mutations from one finalization are gathered in a [`StoreTransaction`]
//! unit-of-work and committed atomically: the queue item disappears, the
//! history item appears, and the mount items land, all in one step.
//!
//! An [`InMemoryStore`] ships for tests and embedding.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, FailureReason, Result};
use crate::processors::SegmentSpan;
use crate::types::{HistoryStatus, JobId, Priority};

/// Directory or file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountItemKind {
    /// Directory node
    Directory,
    /// File node
    File,
}

/// How a file's bytes are produced when the mount serves it
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountContent {
    /// Concatenation of decoded segment byte ranges
    Segments {
        /// Ordered spans reconstructing the file
        spans: Vec<SegmentSpan>,
        /// Spans carry the stored-RAR XOR overlay; undo it when serving
        xor_obfuscated: bool,
    },
    /// Literal text (STRM files)
    Text(String),
}

/// One entry in the virtual filesystem metadata store
#[derive(Clone, Debug)]
pub struct MountItem {
    /// Deterministic identity: UUIDv5 of (parent id, name)
    pub id: Uuid,
    /// Parent directory id
    pub parent_id: Uuid,
    /// Entry name within the parent
    pub name: String,
    /// Directory or file
    pub kind: MountItemKind,
    /// File size (0 for directories)
    pub size: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Release date, when known (used by upstream dashboards)
    pub release_date: Option<DateTime<Utc>>,
    /// Last successful article health check
    pub last_health_check: Option<DateTime<Utc>>,
    /// Reconstruction recipe (files only)
    pub content: Option<MountContent>,
}

impl MountItem {
    /// The deterministic id of a child of `parent` named `name`
    pub fn child_id(parent: Uuid, name: &str) -> Uuid {
        Uuid::new_v5(&parent, name.as_bytes())
    }

    /// Build a directory node under `parent`
    pub fn directory(parent: Uuid, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Self::child_id(parent, &name),
            parent_id: parent,
            name,
            kind: MountItemKind::Directory,
            size: 0,
            created_at: Utc::now(),
            release_date: None,
            last_health_check: None,
            content: None,
        }
    }

    /// Build a file node under `parent`
    pub fn file(parent: Uuid, name: impl Into<String>, size: u64, content: MountContent) -> Self {
        let name = name.into();
        Self {
            id: Self::child_id(parent, &name),
            parent_id: parent,
            name,
            kind: MountItemKind::File,
            size,
            created_at: Utc::now(),
            release_date: None,
            last_health_check: None,
            content: Some(content),
        }
    }
}

/// One job waiting in (or paused within) the queue
#[derive(Clone, Debug)]
pub struct QueueItem {
    /// Job identity, reused by the history item
    pub id: JobId,
    /// Job name (usually the NZB name without extension)
    pub job_name: String,
    /// Target category
    pub category: String,
    /// Sum of declared segment sizes
    pub total_segment_bytes: u64,
    /// Scheduling priority
    pub priority: Priority,
    /// Not eligible before this instant (set after transient failures)
    pub pause_until: Option<DateTime<Utc>>,
    /// Enqueue time (FIFO tie-break)
    pub created_at: DateTime<Utc>,
    /// The NZB document this job processes
    pub nzb_contents: String,
}

/// Terminal record of one processed job
#[derive(Clone, Debug)]
pub struct HistoryItem {
    /// Same id as the queue item that produced it
    pub id: JobId,
    /// Job name
    pub job_name: String,
    /// Completed or Failed
    pub status: HistoryStatus,
    /// User-visible failure message
    pub fail_message: Option<String>,
    /// Categorical failure reason
    pub failure_reason: Option<FailureReason>,
    /// Wall-clock processing time in seconds
    pub download_seconds: u64,
    /// Mount directory the job's files were committed under
    pub download_dir_id: Option<Uuid>,
    /// Original NZB document
    pub nzb_contents: String,
    /// Finalization time
    pub created_at: DateTime<Utc>,
}

/// Unit of work for one finalization
///
/// Aggregators mutate only this object; the finalizer commits it once.
#[derive(Debug, Default)]
pub struct StoreTransaction {
    items: Vec<MountItem>,
    remove_queue: Vec<JobId>,
    history: Vec<HistoryItem>,
}

impl StoreTransaction {
    /// Stage a mount item
    pub fn add_item(&mut self, item: MountItem) {
        self.items.push(item);
    }

    /// Stage a queue item removal
    pub fn remove_queue_item(&mut self, id: JobId) {
        self.remove_queue.push(id);
    }

    /// Stage a history insertion
    pub fn add_history(&mut self, item: HistoryItem) {
        self.history.push(item);
    }

    /// Staged item already carrying this (parent, name)?
    pub fn has_child(&self, parent: Uuid, name: &str) -> bool {
        self.items
            .iter()
            .any(|i| i.parent_id == parent && i.name == name)
    }

    /// Staged mount items
    pub fn items(&self) -> &[MountItem] {
        &self.items
    }

    /// Staged queue removals
    pub fn removed_queue_items(&self) -> &[JobId] {
        &self.remove_queue
    }

    /// Staged history insertions
    pub fn history(&self) -> &[HistoryItem] {
        &self.history
    }
}

/// The narrow store contract the core consumes
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Id of the content root directory
    fn root_id(&self) -> Uuid;

    /// Fetch an item by id
    async fn get_item(&self, id: Uuid) -> Result<Option<MountItem>>;

    /// Fetch a child of `parent` by name
    async fn get_item_child(&self, parent: Uuid, name: &str) -> Result<Option<MountItem>>;

    /// Insert a queue item
    async fn add_queue_item(&self, item: QueueItem) -> Result<()>;

    /// Snapshot of the queue
    async fn queue_items(&self) -> Result<Vec<QueueItem>>;

    /// Pause or unpause a queued job
    async fn set_pause_until(&self, id: JobId, until: Option<DateTime<Utc>>) -> Result<()>;

    /// Remove queue items outside a finalization (operator removal)
    async fn remove_queue_items(&self, ids: &[JobId]) -> Result<()>;

    /// Snapshot of history
    async fn history_items(&self) -> Result<Vec<HistoryItem>>;

    /// Drop history records (retention pruning)
    async fn remove_history(&self, ids: &[JobId]) -> Result<()>;

    /// Apply a finalization transaction atomically
    async fn commit(&self, tx: StoreTransaction) -> Result<()>;
}

/// In-memory store for tests and embedding
pub struct InMemoryStore {
    root: Uuid,
    inner: std::sync::RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, MountItem>,
    queue: Vec<QueueItem>,
    history: Vec<HistoryItem>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create a store with an empty content root
    pub fn new() -> Self {
        let root = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"nzb-mount content root");
        let mut inner = Inner::default();
        inner.items.insert(
            root,
            MountItem {
                id: root,
                parent_id: root,
                name: String::new(),
                kind: MountItemKind::Directory,
                size: 0,
                created_at: Utc::now(),
                release_date: None,
                last_health_check: None,
                content: None,
            },
        );
        Self {
            root,
            inner: std::sync::RwLock::new(inner),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    fn root_id(&self) -> Uuid {
        self.root
    }

    async fn get_item(&self, id: Uuid) -> Result<Option<MountItem>> {
        Ok(self.read().items.get(&id).cloned())
    }

    async fn get_item_child(&self, parent: Uuid, name: &str) -> Result<Option<MountItem>> {
        Ok(self
            .read()
            .items
            .values()
            .find(|i| i.parent_id == parent && i.name == name && i.id != i.parent_id)
            .cloned())
    }

    async fn add_queue_item(&self, item: QueueItem) -> Result<()> {
        let mut inner = self.write();
        if inner.queue.iter().any(|q| q.id == item.id) {
            return Err(Error::Store(format!("queue item {} already exists", item.id)));
        }
        inner.queue.push(item);
        Ok(())
    }

    async fn queue_items(&self) -> Result<Vec<QueueItem>> {
        Ok(self.read().queue.clone())
    }

    async fn set_pause_until(&self, id: JobId, until: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.write();
        match inner.queue.iter_mut().find(|q| q.id == id) {
            Some(item) => {
                item.pause_until = until;
                Ok(())
            }
            None => Err(Error::Store(format!("queue item {id} not found"))),
        }
    }

    async fn remove_queue_items(&self, ids: &[JobId]) -> Result<()> {
        self.write().queue.retain(|q| !ids.contains(&q.id));
        Ok(())
    }

    async fn history_items(&self) -> Result<Vec<HistoryItem>> {
        Ok(self.read().history.clone())
    }

    async fn remove_history(&self, ids: &[JobId]) -> Result<()> {
        self.write().history.retain(|h| !ids.contains(&h.id));
        Ok(())
    }

    async fn commit(&self, tx: StoreTransaction) -> Result<()> {
        let mut inner = self.write();
        for item in tx.items {
            inner.items.insert(item.id, item);
        }
        inner.queue.retain(|q| !tx.remove_queue.contains(&q.id));
        inner.history.extend(tx.history);
        Ok(())
    }
}
