//! # contract: interfaces to the upstream feed and the persistent store
//!
//! The sync loop never talks to the network or to storage directly. It goes through the two
//! traits below, which lets the binary plug in the HTTP client and a file-backed store while
//! tests plug in `mockall` mocks or the in-memory store.
//!
//! ## Store notifications
//! A [`ListStore`] publishes [`ChangeBatch`]es. Each batch carries the changes that produced it
//! plus the full listing ordered newest first by `received_at`. The first batch delivered to a
//! new subscriber lists every existing record as [`ChangeKind::Added`].
//!
//! ## Mocking
//! Both traits are annotated for `mockall` (`MockListSource`, `MockListStore`), exported with the
//! `test-export-mocks` feature so integration tests can use them.

use async_trait::async_trait;
use futures::stream::BoxStream;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{SourceError, StoreError};
use crate::record::{ListRecord, StoredList};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// One entry of a change batch. `index` is the position in the new listing for added and
/// modified records, and the former position for removed ones.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    pub index: usize,
    pub list: StoredList,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub changes: Vec<Change>,
    /// Everything currently stored, newest first.
    pub listing: Vec<StoredList>,
}

impl ChangeBatch {
    /// The record this batch added at the head of the listing, if any. This is the
    /// authoritative "latest known" list.
    pub fn latest_added(&self) -> Option<&StoredList> {
        self.changes
            .iter()
            .find(|c| c.kind == ChangeKind::Added && c.index == 0)
            .map(|c| &c.list)
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeBatch, StoreError>>;

/// Read-only access to the upstream price list feed.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ListSource: Send + Sync {
    /// Perform one request for the current upstream list and return its raw JSON.
    async fn fetch_latest(&self) -> Result<serde_json::Value, SourceError>;
}

/// The persistent collection of price lists.
///
/// The store does not deduplicate: adding a record whose `id` is already stored creates a second
/// entry. Deduplication is the caller's job.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ListStore: Send + Sync {
    /// Append a record. The store assigns its key and `received_at`.
    async fn add(&self, record: ListRecord) -> Result<StoredList, StoreError>;

    /// Delete a stored record by key. Deleting a key that is already gone succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Subscribe to change batches, ordered newest first.
    async fn subscribe(&self) -> Result<ChangeStream, StoreError>;
}
