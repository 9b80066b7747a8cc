//! Dedup gate: trailing-edge throttle plus duplicate suppression in front of the store.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::record::ListRecord;

/// Lets at most one candidate through per throttle window and never forwards the same list id
/// twice in a row, nor one the store has already confirmed as latest.
///
/// The gate is passive: [`submit`](DedupGate::submit) returns the instant at which the caller
/// should call [`flush`](DedupGate::flush).
#[derive(Debug)]
pub struct DedupGate {
    window: Duration,
    pending: Option<ListRecord>,
    closes_at: Option<Instant>,
    last_forwarded: Option<String>,
}

impl DedupGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            closes_at: None,
            last_forwarded: None,
        }
    }

    /// Offer a candidate. Opens a window if none is open; otherwise replaces the pending
    /// candidate, which is dropped.
    pub fn submit(&mut self, candidate: ListRecord, now: Instant) -> Instant {
        let closes_at = *self.closes_at.get_or_insert(now + self.window);
        if let Some(dropped) = self.pending.replace(candidate) {
            debug!(dropped = %dropped.id, "[GATE] Superseded pending candidate");
        }
        closes_at
    }

    /// When the open window closes, if one is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.closes_at
    }

    pub fn last_forwarded(&self) -> Option<&str> {
        self.last_forwarded.as_deref()
    }

    /// Forget a forwarded id whose write failed, so the same list can pass again.
    pub fn forget(&mut self, id: &str) {
        if self.last_forwarded.as_deref() == Some(id) {
            debug!(id, "[GATE] Forgetting unpersisted list");
            self.last_forwarded = None;
        }
    }

    /// Close the window if it is due and return the candidate worth persisting, if any.
    /// `latest_known` is the id the store has confirmed most recently.
    pub fn flush(&mut self, now: Instant, latest_known: Option<&str>) -> Option<ListRecord> {
        match self.closes_at {
            Some(closes_at) if closes_at <= now => {}
            _ => return None,
        }
        self.closes_at = None;
        let candidate = self.pending.take()?;

        if self.last_forwarded.as_deref() == Some(candidate.id.as_str()) {
            debug!(id = %candidate.id, "[GATE] Dropped repeat of last forwarded list");
            return None;
        }
        if latest_known == Some(candidate.id.as_str()) {
            debug!(id = %candidate.id, "[GATE] Dropped list already confirmed as latest");
            return None;
        }

        self.last_forwarded = Some(candidate.id.clone());
        Some(candidate)
    }
}
