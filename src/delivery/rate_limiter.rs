//! Process-wide limit on outbound API calls.
//!
//! A sliding-window log: the instants of the most recent calls are kept,
//! and a new call is admitted only while fewer than `calls_per_window` of
//! them fall inside the trailing window. Unlike a refilling bucket this
//! guarantees the bound for *every* window, which is what the upstream
//! API enforces (Resend allows 10 requests per second).
//!
//! ```text
//! limit: 2 calls / 1s
//! t=0.0  acquire -> ok
//! t=0.1  acquire -> ok
//! t=0.2  acquire -> waits until t=1.0
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Configuration for the call-rate gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Calls admitted per window.
    pub calls_per_window: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_window: 10,
            window: Duration::from_secs(1),
        }
    }
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Calls that would be admitted right now without waiting.
    pub remaining: u32,
    /// Time until the oldest call leaves the window. Zero when idle.
    pub reset_in: Duration,
}

/// Shared rate limiter. Clone the `Arc`, not the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let capacity = config.calls_per_window.max(1) as usize;
        Self {
            capacity,
            window: config.window,
            calls: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Take a slot if one is free.
    ///
    /// # Errors
    ///
    /// Returns how long to wait before a slot frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut calls, now);

        if calls.len() < self.capacity {
            calls.push_back(now);
            Ok(())
        } else {
            let oldest = calls.front().copied().unwrap_or(now);
            Err((oldest + self.window).saturating_duration_since(now))
        }
    }

    /// Wait for a slot. Never rejects.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => {
                    tracing::trace!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        let now = Instant::now();
        let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        self.evict(&mut calls, now);

        RateLimitStats {
            remaining: (self.capacity - calls.len()) as u32,
            reset_in: calls
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or_default(),
        }
    }

    fn evict(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = calls.front() {
            if now.duration_since(*oldest) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn limiter(calls: u32, window_ms: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            calls_per_window: calls,
            window: Duration::from_millis(window_ms),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_capacity_then_reports_wait() {
        let limiter = limiter(3, 1000);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());

        let wait = limiter.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_millis(1000));
        assert_eq!(limiter.stats().remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slots_free_after_window() {
        let limiter = limiter(2, 1000);
        limiter.try_acquire().unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;
        limiter.try_acquire().unwrap();

        tokio::time::advance(Duration::from_millis(600)).await;
        // First call has left the window, second has not.
        let stats = limiter.stats();
        assert_eq!(stats.remaining, 1);
        assert_eq!(stats.reset_in, Duration::from_millis(400));
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_instead_of_rejecting() {
        let limiter = limiter(2, 1000);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_never_exceed_rate() {
        let limiter = Arc::new(limiter(3, 1000));
        let mut handles = Vec::new();
        for _ in 0..12 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for h in handles {
            admitted.push(h.await.unwrap());
        }
        admitted.sort();

        for (i, start) in admitted.iter().enumerate() {
            let in_window = admitted[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < Duration::from_millis(1000))
                .count();
            assert!(in_window <= 3, "{in_window} calls inside one window");
        }
        let span = admitted.last().unwrap().duration_since(admitted[0]);
        assert!(span >= Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn idle_stats() {
        let limiter = limiter(5, 1000);
        let stats = limiter.stats();
        assert_eq!(stats.remaining, 5);
        assert_eq!(stats.reset_in, Duration::ZERO);
    }
}
