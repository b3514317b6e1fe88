//! Running counters for one campaign run.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::campaign::model::DeliveryOutcome;

/// Immutable view of the counters. `total == success + failed` always holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub elapsed_secs: f64,
    /// Completed outcomes per second since the aggregator was created.
    pub rate: f64,
}

impl StatsSnapshot {
    /// Fraction of successful outcomes, 0.0 before anything completed.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    success: u64,
    failed: u64,
}

/// Shared by every worker of a run. All three counters move under one lock.
#[derive(Debug)]
pub struct StatsAggregator {
    started: Instant,
    counters: Mutex<Counters>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn add(&self, outcome: &DeliveryOutcome) {
        let mut c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        if outcome.success {
            c.success += 1;
        } else {
            c.failed += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let (success, failed) = {
            let c = self.counters.lock().unwrap_or_else(|e| e.into_inner());
            (c.success, c.failed)
        };
        let total = success + failed;
        let elapsed_secs = self.started.elapsed().as_secs_f64();
        StatsSnapshot {
            total,
            success,
            failed,
            elapsed_secs,
            rate: if elapsed_secs > 0.0 {
                total as f64 / elapsed_secs
            } else {
                0.0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn counts_success_and_failure() {
        let stats = StatsAggregator::new();
        stats.add(&DeliveryOutcome::sent("a@example.com", "resend", 200, None));
        stats.add(&DeliveryOutcome::failed("b@example.com", "resend", 500, "boom"));
        stats.add(&DeliveryOutcome::dry_run("c@example.com"));

        let snap = stats.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.success, 2);
        assert_eq!(snap.failed, 1);
        assert!((snap.success_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_follows_elapsed_time() {
        let stats = StatsAggregator::new();
        stats.add(&DeliveryOutcome::sent("a@example.com", "resend", 200, None));
        stats.add(&DeliveryOutcome::sent("b@example.com", "resend", 200, None));
        tokio::time::advance(std::time::Duration::from_secs(2)).await;

        let snap = stats.snapshot();
        assert_eq!(snap.elapsed_secs, 2.0);
        assert_eq!(snap.rate, 1.0);
    }

    #[test]
    fn empty_snapshot() {
        let snap = StatsAggregator::new().snapshot();
        assert_eq!(snap.total, 0);
        assert_eq!(snap.success_rate(), 0.0);
    }

    #[test]
    fn concurrent_adds_stay_consistent() {
        let stats = Arc::new(StatsAggregator::new());
        let mut handles = Vec::new();
        for t in 0..8 {
            let stats = stats.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    let outcome = if (t + i) % 3 == 0 {
                        DeliveryOutcome::failed("x@example.com", "resend", 422, "bad")
                    } else {
                        DeliveryOutcome::sent("x@example.com", "resend", 200, None)
                    };
                    stats.add(&outcome);
                    let snap = stats.snapshot();
                    assert_eq!(snap.total, snap.success + snap.failed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().total, 4000);
    }
}
