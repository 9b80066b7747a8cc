#![doc = "pricelist-sync-core: core logic library for pricelist-sync."]

//! Keeps a store of price lists in step with an upstream feed whose lists expire.
//!
//! The [`synchronise::SyncLoop`] ties the pieces together:
//! - [`freshness`] decides when to look upstream again,
//! - [`download`] fetches with bounded retries,
//! - [`gate`] throttles and deduplicates what reaches the store,
//! - [`prune`] trims the store's history.
//!
//! Network and storage sit behind the traits in [`contract`].

pub mod clock;
pub mod config;
pub mod contract;
pub mod download;
pub mod error;
pub mod freshness;
pub mod gate;
pub mod prune;
pub mod record;
pub mod store;
pub mod synchronise;

pub use config::SyncConfig;
pub use error::{MalformedRecord, SourceError, StoreError, SyncError};
pub use record::{ListRecord, StoredList};
pub use synchronise::{SyncLoop, SyncState, SyncStatus};
