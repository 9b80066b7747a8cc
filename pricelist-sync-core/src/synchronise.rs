//! The sync loop: keeps the store's newest price list current.
//!
//! One task owns all loop state and reacts, through a single `select!`, to:
//!   - freshness clock continuations (time to check upstream again),
//!   - fetch results coming back from a background fetch task,
//!   - the dedup gate's throttle window closing,
//!   - failed store writes, which the gate forgets so the list can be retried,
//!   - change batches from the store.
//!
//! # States
//! - [`SyncState::IdleWaiting`]: a clock wait is armed.
//! - [`SyncState::Checking`]: a continuation fired; staleness is re-evaluated against the
//!   *current* latest record, which may have changed while waiting.
//! - [`SyncState::Fetching`]: a fetch task is in flight. Notifications keep being processed.
//!
//! # Latest known record
//! Only the store's change batches update it. A list handed to the store is not trusted until
//! the store reports it back.
//!
//! # Error handling
//! Nothing here stops the loop. Fetch exhaustion, malformed responses, store write failures and
//! subscription errors are logged and the loop re-arms.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::contract::{ChangeBatch, ChangeStream, ListSource, ListStore};
use crate::download::{FetchOutcome, Fetcher, RetryPolicy};
use crate::error::{StoreError, SyncError};
use crate::freshness::{Continuation, FreshnessClock, WaitPlan};
use crate::gate::DedupGate;
use crate::prune::{prune_candidates, HistoryPruner};
use crate::record::{ListRecord, StoredList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    IdleWaiting,
    Checking,
    Fetching,
}

/// Snapshot of the loop published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub latest_id: Option<String>,
    pub latest_valid_until: Option<DateTime<Utc>>,
    pub generation: u64,
    /// Lists handed to the store since startup.
    pub forwarded: u64,
}

pub struct SyncLoop {
    config: SyncConfig,
    fetcher: Arc<Fetcher>,
    store: Arc<dyn ListStore>,
    clock: Arc<dyn Clock>,
    freshness: FreshnessClock,
    continuations: mpsc::UnboundedReceiver<Continuation>,
    fetch_tx: mpsc::UnboundedSender<FetchOutcome>,
    fetch_rx: mpsc::UnboundedReceiver<FetchOutcome>,
    write_failed_tx: mpsc::UnboundedSender<String>,
    write_failed_rx: mpsc::UnboundedReceiver<String>,
    gate: DedupGate,
    pruner: HistoryPruner,
    latest: Option<StoredList>,
    state: SyncState,
    generation: u64,
    forwarded: u64,
    status: watch::Sender<SyncStatus>,
}

impl SyncLoop {
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn ListSource>,
        store: Arc<dyn ListStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (freshness, continuations) = FreshnessClock::new(&config);
        let (fetch_tx, fetch_rx) = mpsc::unbounded_channel();
        let (write_failed_tx, write_failed_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SyncStatus {
            state: SyncState::IdleWaiting,
            latest_id: None,
            latest_valid_until: None,
            generation: 0,
            forwarded: 0,
        });
        Self {
            fetcher: Arc::new(Fetcher::new(source, RetryPolicy::from_config(&config))),
            gate: DedupGate::new(config.throttle_window()),
            pruner: HistoryPruner::new(store.clone(), config.retention),
            config,
            store,
            clock,
            freshness,
            continuations,
            fetch_tx,
            fetch_rx,
            write_failed_tx,
            write_failed_rx,
            latest: None,
            state: SyncState::IdleWaiting,
            generation: 0,
            forwarded: 0,
            status,
        }
    }

    /// Watch the loop's status. Stays valid after [`run`](SyncLoop::run) takes ownership.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Run forever. The only way to stop the loop is to drop or abort its task.
    pub async fn run(mut self) {
        info!(
            retention = self.config.retention,
            throttle_window_ms = self.config.throttle_window_ms,
            "[SYNC] Starting sync loop"
        );

        let mut notifications = self.open_subscription().await;
        let mut resubscribe_at = notifications
            .is_none()
            .then(|| Instant::now() + self.freshness.grace_delay());

        // Cold start always checks upstream, whatever the initial snapshot holds.
        self.start_fetch();

        loop {
            let gate_deadline = self.gate.deadline();
            tokio::select! {
                biased;
                next = next_batch(&mut notifications) => match next {
                    Some(Ok(batch)) => self.on_batch(batch),
                    Some(Err(StoreError::Lagged(dropped))) => {
                        // A dropped batch may have carried the new head; start over from a full snapshot.
                        warn!(dropped, "[SYNC] Change stream lagged, resubscribing");
                        notifications = self.open_subscription().await;
                        resubscribe_at = notifications
                            .is_none()
                            .then(|| Instant::now() + self.freshness.grace_delay());
                        self.rearm_if_idle();
                    }
                    Some(Err(source)) => self.on_notification_error(source),
                    None => {
                        warn!("[SYNC] Change stream ended, resubscribing");
                        notifications = None;
                        resubscribe_at = Some(Instant::now() + self.freshness.grace_delay());
                        self.rearm_if_idle();
                    }
                },
                Some(outcome) = self.fetch_rx.recv() => self.on_fetched(outcome),
                Some(id) = self.write_failed_rx.recv() => self.gate.forget(&id),
                Some(continuation) = self.continuations.recv() => self.on_continuation(continuation),
                _ = sleep_until_opt(gate_deadline) => self.flush_gate(),
                _ = sleep_until_opt(resubscribe_at) => {
                    notifications = self.open_subscription().await;
                    resubscribe_at = notifications
                        .is_none()
                        .then(|| Instant::now() + self.freshness.grace_delay());
                }
            }
        }
    }

    async fn open_subscription(&self) -> Option<ChangeStream> {
        match self.store.subscribe().await {
            Ok(stream) => {
                debug!("[SYNC] Subscribed to store changes");
                Some(stream)
            }
            Err(source) => {
                let err = SyncError::StoreNotification(source);
                error!(error = %err, "[SYNC][ERROR] Could not subscribe to store changes");
                None
            }
        }
    }

    fn latest_record(&self) -> Option<&ListRecord> {
        self.latest.as_ref().map(|l| &l.record)
    }

    fn set_state(&mut self, state: SyncState) {
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status.send_replace(SyncStatus {
            state: self.state,
            latest_id: self.latest.as_ref().map(|l| l.record.id.clone()),
            latest_valid_until: self.latest.as_ref().map(|l| l.record.valid_until),
            generation: self.generation,
            forwarded: self.forwarded,
        });
    }

    /// Arm the freshness clock from the best known record and go idle. After a fetch, an
    /// immediate plan is stretched to the grace delay so an empty store cannot cause a tight
    /// fetch loop.
    fn rearm(&mut self, after_fetch: bool) {
        let now = self.clock.now();
        let plan = match self.freshness.plan(self.latest_record(), now) {
            WaitPlan::Immediate if after_fetch => WaitPlan::Grace(self.freshness.grace_delay()),
            plan => plan,
        };
        self.generation = self.freshness.arm(plan);
        info!(
            generation = self.generation,
            wait_ms = plan.delay().as_millis() as u64,
            latest = self.latest_record().map(|r| r.id.as_str()).unwrap_or("<none>"),
            "[SYNC] Next check scheduled"
        );
        self.set_state(SyncState::IdleWaiting);
    }

    /// Re-arm unless a fetch is in flight; the fetch result re-arms on its own.
    fn rearm_if_idle(&mut self) {
        if self.state != SyncState::Fetching {
            self.rearm(true);
        }
    }

    fn on_continuation(&mut self, continuation: Continuation) {
        if continuation.generation != self.generation {
            debug!(
                generation = continuation.generation,
                current = self.generation,
                "[SYNC] Ignoring superseded continuation"
            );
            return;
        }
        if self.state == SyncState::Fetching {
            debug!("[SYNC] Fetch already in flight, ignoring continuation");
            return;
        }

        self.set_state(SyncState::Checking);
        let now = self.clock.now();
        match self.latest_record() {
            Some(record) if !record.is_stale(now) => {
                debug!(id = %record.id, valid_until = %record.valid_until, "[SYNC] Latest list still fresh");
                self.rearm(false);
            }
            _ => {
                info!(
                    now = %now,
                    valid_until = ?self.latest_record().map(|r| r.valid_until),
                    "[SYNC] Latest list stale or unknown, fetching"
                );
                self.start_fetch();
            }
        }
    }

    fn start_fetch(&mut self) {
        self.set_state(SyncState::Fetching);
        let fetcher = self.fetcher.clone();
        let results = self.fetch_tx.clone();
        tokio::spawn(async move {
            let outcome = fetcher.fetch().await;
            let _ = results.send(outcome);
        });
    }

    fn on_fetched(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Fetched(record) => {
                if self.latest_record().map(|r| r.id.as_str()) == Some(record.id.as_str()) {
                    warn!(id = %record.id, "[SYNC] Latest list is already in the store");
                } else {
                    let id = record.id.clone();
                    let closes_at = self.gate.submit(record, Instant::now());
                    debug!(
                        %id,
                        window_closes_in_ms = closes_at
                            .saturating_duration_since(Instant::now())
                            .as_millis() as u64,
                        "[SYNC] Submitted candidate to dedup gate"
                    );
                }
            }
            FetchOutcome::Malformed(reason) => {
                let err = SyncError::from(reason);
                warn!(error = %err, "[SYNC] Discarding upstream response");
            }
            FetchOutcome::Exhausted { attempts } => {
                let err = SyncError::FetchExhausted { attempts };
                warn!(error = %err, "[SYNC] No new data this cycle");
            }
        }
        self.rearm(true);
    }

    fn flush_gate(&mut self) {
        let latest_id = self.latest.as_ref().map(|l| l.record.id.as_str());
        let Some(record) = self.gate.flush(Instant::now(), latest_id) else {
            return;
        };

        self.forwarded += 1;
        self.publish_status();
        info!(id = %record.id, "[SYNC] Persisting new list");
        let store = self.store.clone();
        let write_failed = self.write_failed_tx.clone();
        tokio::spawn(async move {
            let id = record.id.clone();
            match store.add(record).await {
                Ok(stored) => {
                    info!(%id, key = %stored.key, "[SYNC] New list added to store");
                }
                Err(source) => {
                    let err = SyncError::StoreWrite { id: id.clone(), source };
                    error!(error = %err, "[SYNC][ERROR] Store write failed");
                    let _ = write_failed.send(id);
                }
            }
        });
    }

    fn on_batch(&mut self, batch: ChangeBatch) {
        debug!(
            changes = batch.changes.len(),
            stored = batch.listing.len(),
            "[SYNC] Received change batch"
        );

        if let Some(newest) = batch.latest_added() {
            let same_key = self.latest.as_ref().map(|l| l.key.as_str()) == Some(newest.key.as_str());
            if !same_key {
                let id_changed =
                    self.latest_record().map(|r| r.id.as_str()) != Some(newest.record.id.as_str());
                // A re-stored copy of the same id still moves the protected key to the head.
                self.latest = Some(newest.clone());
                self.publish_status();
                if id_changed {
                    info!(
                        id = %newest.record.id,
                        valid_until = %newest.record.valid_until,
                        "[SYNC] Store confirmed a new latest list"
                    );
                    self.rearm_if_idle();
                }
            }
        }

        let protected = self.latest.as_ref().map(|l| l.key.as_str());
        if !prune_candidates(&batch.listing, self.pruner.retention(), protected).is_empty() {
            let pruner = self.pruner.clone();
            let protected = protected.map(str::to_owned);
            let listing = batch.listing;
            tokio::spawn(async move {
                pruner.prune(&listing, protected.as_deref()).await;
            });
        }
    }

    fn on_notification_error(&mut self, source: StoreError) {
        let err = SyncError::StoreNotification(source);
        error!(error = %err, "[SYNC][ERROR] Change notification failed, starting a fresh cycle");
        self.rearm_if_idle();
    }
}

async fn next_batch(
    stream: &mut Option<ChangeStream>,
) -> Option<Result<ChangeBatch, StoreError>> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
