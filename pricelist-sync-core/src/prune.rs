//! History pruning: keep only the newest `retention` lists in the store.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use crate::contract::ListStore;
use crate::error::SyncError;
use crate::record::StoredList;

/// Stored lists past the retention window, oldest last. The list with key `protected_key`
/// is never a candidate.
pub fn prune_candidates<'a>(
    listing: &'a [StoredList],
    retention: usize,
    protected_key: Option<&str>,
) -> Vec<&'a StoredList> {
    let mut ordered: Vec<&StoredList> = listing.iter().collect();
    ordered.sort_by(|a, b| b.received_at.cmp(&a.received_at));
    ordered
        .into_iter()
        .skip(retention)
        .filter(|list| Some(list.key.as_str()) != protected_key)
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<String>,
    pub failed: Vec<String>,
}

#[derive(Clone)]
pub struct HistoryPruner {
    store: Arc<dyn ListStore>,
    retention: usize,
}

impl HistoryPruner {
    pub fn new(store: Arc<dyn ListStore>, retention: usize) -> Self {
        Self { store, retention }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Delete everything past the retention window. Best effort: failures are logged and left
    /// for the next batch.
    pub async fn prune(&self, listing: &[StoredList], protected_key: Option<&str>) -> PruneReport {
        let keys: Vec<String> = prune_candidates(listing, self.retention, protected_key)
            .into_iter()
            .map(|list| list.key.clone())
            .collect();
        if keys.is_empty() {
            return PruneReport::default();
        }

        let results = join_all(keys.iter().map(|key| self.store.delete(key))).await;

        let mut report = PruneReport::default();
        for (key, result) in keys.into_iter().zip(results) {
            match result {
                Ok(()) => report.deleted.push(key),
                Err(source) => {
                    let err = SyncError::PruneDelete {
                        key: key.clone(),
                        source,
                    };
                    error!(error = %err, "[PRUNE][ERROR] Delete failed, retrying on next batch");
                    report.failed.push(key);
                }
            }
        }
        info!(
            retention = self.retention,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "[PRUNE] Trimmed stored history"
        );
        report
    }
}
