use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Source of wall-clock time for staleness decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock derived from tokio's monotonic clock, starting at a fixed instant.
/// It follows tokio's paused/advanced time, so timing tests stay deterministic.
pub struct TokioClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl TokioClock {
    pub fn starting_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.anchor.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor_wall + elapsed
    }
}
