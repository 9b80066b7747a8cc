//! Store implementations: an in-memory store with change broadcasting and a JSON-file backed
//! store built on it.
//!
//! Both implement [`ListStore`]. Records are kept newest first; every mutation is broadcast as
//! a [`ChangeBatch`] to all subscribers, and a new subscriber first receives the whole current
//! listing as `Added` changes.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::contract::{Change, ChangeBatch, ChangeKind, ChangeStream, ListStore};
use crate::error::StoreError;
use crate::record::{ListRecord, StoredList};

const CHANGE_BUFFER: usize = 64;

pub struct MemoryListStore {
    listing: Mutex<Vec<StoredList>>,
    changes: broadcast::Sender<ChangeBatch>,
}

impl Default for MemoryListStore {
    fn default() -> Self {
        Self::with_listing(Vec::new())
    }
}

impl MemoryListStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from existing records, in any order.
    pub fn with_listing(mut listing: Vec<StoredList>) -> Self {
        listing.sort_by(|a, b| b.received_at.cmp(&a.received_at));
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            listing: Mutex::new(listing),
            changes,
        }
    }

    /// Current records, newest first.
    pub fn snapshot(&self) -> Result<Vec<StoredList>, StoreError> {
        Ok(self.lock()?.clone())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<StoredList>>, StoreError> {
        self.listing
            .lock()
            .map_err(|_| StoreError::Other("store lock poisoned".into()))
    }

    fn publish(&self, batch: ChangeBatch) {
        // No subscribers is fine.
        let _ = self.changes.send(batch);
    }

    /// Assign a key and a `received_at` strictly after the current newest, without storing.
    fn stamp(&self, record: ListRecord) -> Result<StoredList, StoreError> {
        let listing = self.lock()?;
        let mut received_at = Utc::now();
        if let Some(newest) = listing.first() {
            if received_at <= newest.received_at {
                received_at = newest.received_at + chrono::Duration::microseconds(1);
            }
        }
        Ok(StoredList {
            key: uuid::Uuid::new_v4().to_string(),
            received_at,
            record,
        })
    }

    /// Insert a stamped list at the head and notify subscribers.
    fn commit_add(&self, stored: StoredList) -> Result<(), StoreError> {
        let batch = {
            let mut listing = self.lock()?;
            listing.insert(0, stored.clone());
            ChangeBatch {
                changes: vec![Change {
                    kind: ChangeKind::Added,
                    index: 0,
                    list: stored.clone(),
                }],
                listing: listing.clone(),
            }
        };
        debug!(key = %stored.key, id = %stored.record.id, "[STORE] Added list");
        self.publish(batch);
        Ok(())
    }

    /// Remove by key and notify subscribers. A missing key is not a change.
    fn commit_delete(&self, key: &str) -> Result<(), StoreError> {
        let batch = {
            let mut listing = self.lock()?;
            let Some(index) = listing.iter().position(|l| l.key == key) else {
                return Ok(());
            };
            let removed = listing.remove(index);
            ChangeBatch {
                changes: vec![Change {
                    kind: ChangeKind::Removed,
                    index,
                    list: removed,
                }],
                listing: listing.clone(),
            }
        };
        debug!(key, "[STORE] Deleted list");
        self.publish(batch);
        Ok(())
    }
}

#[async_trait]
impl ListStore for MemoryListStore {
    async fn add(&self, record: ListRecord) -> Result<StoredList, StoreError> {
        let stored = self.stamp(record)?;
        self.commit_add(stored.clone())?;
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.commit_delete(key)
    }

    async fn subscribe(&self) -> Result<ChangeStream, StoreError> {
        // Subscribe under the lock so no change slips between the snapshot and the receiver.
        let (rx, initial) = {
            let listing = self.lock()?;
            let rx = self.changes.subscribe();
            let initial = ChangeBatch {
                changes: listing
                    .iter()
                    .enumerate()
                    .map(|(index, list)| Change {
                        kind: ChangeKind::Added,
                        index,
                        list: list.clone(),
                    })
                    .collect(),
                listing: listing.clone(),
            };
            (rx, initial)
        };

        let updates = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await {
                Ok(batch) => Some((Ok(batch), rx)),
                Err(RecvError::Lagged(dropped)) => Some((Err(StoreError::Lagged(dropped)), rx)),
                Err(RecvError::Closed) => None,
            }
        });
        Ok(stream::once(async move { Ok::<_, StoreError>(initial) })
            .chain(updates)
            .boxed())
    }
}

/// [`MemoryListStore`] whose contents survive restarts in a JSON file. Every mutation is written
/// atomically to disk before it reaches memory or subscribers; a failed write changes nothing.
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryListStore,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Load the store from `path`, or start empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let listing: Vec<StoredList> = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };
        info!(path = %path.display(), lists = listing.len(), "[STORE] Opened JSON file store");
        Ok(Self {
            path,
            inner: MemoryListStore::with_listing(listing),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Result<Vec<StoredList>, StoreError> {
        self.inner.snapshot()
    }

    /// Write `listing` to disk off the async runtime. Nothing is committed in memory until this
    /// succeeds, so subscribers only ever see persisted state.
    async fn persist(&self, listing: Vec<StoredList>) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_listing(&path, &listing))
            .await
            .map_err(|e| StoreError::Other(format!("store writer task failed: {e}")))?
    }
}

fn write_listing(path: &Path, listing: &[StoredList]) -> Result<(), StoreError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, listing)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl ListStore for JsonFileStore {
    async fn add(&self, record: ListRecord) -> Result<StoredList, StoreError> {
        let _guard = self.write_lock.lock().await;
        let stored = self.inner.stamp(record)?;
        let mut listing = self.inner.snapshot()?;
        listing.insert(0, stored.clone());
        self.persist(listing).await?;
        self.inner.commit_add(stored.clone())?;
        Ok(stored)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut listing = self.inner.snapshot()?;
        let before = listing.len();
        listing.retain(|l| l.key != key);
        if listing.len() == before {
            return Ok(());
        }
        self.persist(listing).await?;
        self.inner.commit_delete(key)
    }

    async fn subscribe(&self) -> Result<ChangeStream, StoreError> {
        self.inner.subscribe().await
    }
}
