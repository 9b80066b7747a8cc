//! Freshness clock: how long to wait before checking upstream again.
//!
//! [`FreshnessClock::plan`] is a pure decision over the latest known record. [`FreshnessClock::arm`]
//! turns a plan into a timer task that reports back through a channel. Every arm bumps a
//! generation number; a wait that has been superseded stops its progress logging and never
//! reports.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, Interval};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::record::ListRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPlan {
    /// Nothing is known yet: check right away.
    Immediate,
    /// The latest list has expired; give upstream a moment to publish its replacement.
    Grace(Duration),
    /// The latest list is valid for a while; check just after it expires.
    UntilExpiry(Duration),
}

impl WaitPlan {
    pub fn delay(&self) -> Duration {
        match self {
            WaitPlan::Immediate => Duration::ZERO,
            WaitPlan::Grace(d) | WaitPlan::UntilExpiry(d) => *d,
        }
    }
}

/// Delivered when an armed wait elapses without being superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Continuation {
    pub generation: u64,
    pub plan: WaitPlan,
}

pub struct FreshnessClock {
    grace_delay: Duration,
    safety_margin: Duration,
    progress_interval: Duration,
    generation: watch::Sender<u64>,
    fired: mpsc::UnboundedSender<Continuation>,
}

impl FreshnessClock {
    /// Returns the clock and the receiving end its continuations arrive on.
    pub fn new(config: &SyncConfig) -> (Self, mpsc::UnboundedReceiver<Continuation>) {
        let (fired, continuations) = mpsc::unbounded_channel();
        let (generation, _) = watch::channel(0);
        let clock = Self {
            grace_delay: config.grace_delay(),
            safety_margin: config.safety_margin(),
            progress_interval: config.progress_interval(),
            generation,
            fired,
        };
        (clock, continuations)
    }

    pub fn grace_delay(&self) -> Duration {
        self.grace_delay
    }

    /// The generation of the most recent arm; 0 before the first.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    pub fn plan(&self, latest: Option<&ListRecord>, now: DateTime<Utc>) -> WaitPlan {
        let Some(record) = latest else {
            return WaitPlan::Immediate;
        };
        match (record.valid_until - now).to_std() {
            Ok(remaining) if !remaining.is_zero() => {
                WaitPlan::UntilExpiry(remaining + self.safety_margin)
            }
            _ => WaitPlan::Grace(self.grace_delay),
        }
    }

    /// Start waiting according to `plan`. Any wait still outstanding is superseded.
    pub fn arm(&self, plan: WaitPlan) -> u64 {
        let generation = self.generation() + 1;
        self.generation.send_replace(generation);

        let superseded = self.generation.subscribe();
        let fired = self.fired.clone();
        let progress_every = self.progress_interval;
        debug!(generation, ?plan, "[CLOCK] Armed");

        tokio::spawn(async move {
            if wait_out(generation, plan.delay(), progress_every, superseded).await {
                // The receiver only goes away with the sync loop itself.
                let _ = fired.send(Continuation { generation, plan });
            }
        });
        generation
    }
}

/// Sleeps for `delay`, logging progress. Returns false if a newer arm superseded this one.
async fn wait_out(
    generation: u64,
    delay: Duration,
    progress_every: Duration,
    mut superseded: watch::Receiver<u64>,
) -> bool {
    let deadline = Instant::now() + delay;
    let sleep = time::sleep_until(deadline);
    tokio::pin!(sleep);

    let mut progress = (!progress_every.is_zero() && delay > progress_every)
        .then(|| time::interval_at(Instant::now() + progress_every, progress_every));

    loop {
        tokio::select! {
            biased;
            _ = &mut sleep => return true,
            changed = superseded.changed() => {
                if changed.is_err() || *superseded.borrow() != generation {
                    debug!(generation, "[CLOCK] Wait superseded");
                    return false;
                }
            }
            _ = next_tick(&mut progress) => {
                let left = deadline.saturating_duration_since(Instant::now());
                info!(
                    generation,
                    seconds_left = left.as_secs(),
                    "[CLOCK] Waiting for updates"
                );
            }
        }
    }
}

async fn next_tick(progress: &mut Option<Interval>) {
    match progress {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
