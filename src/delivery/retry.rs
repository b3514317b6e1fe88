//! Bounded retry with exponential backoff and jitter.
//!
//! Whether a failure is worth retrying is decided by the fault itself
//! through [`RetrySignal`]; the policy only decides how long to wait.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{ProviderError, ProviderErrorKind};

/// Lowest base delay used after a 429.
pub const RATE_LIMIT_FLOOR: Duration = Duration::from_millis(600);
/// Lowest base delay used after a 5xx.
pub const SERVER_ERROR_FLOOR: Duration = Duration::from_millis(1200);
/// No single backoff sleep exceeds this.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

/// What a fault tells the retry loop about itself.
pub trait RetrySignal {
    fn is_retriable(&self) -> bool;

    fn is_rate_limited(&self) -> bool {
        false
    }

    fn is_server_error(&self) -> bool {
        false
    }

    /// Server-provided minimum wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetrySignal for ProviderError {
    fn is_retriable(&self) -> bool {
        self.retriable
    }

    fn is_rate_limited(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimited
    }

    fn is_server_error(&self) -> bool {
        self.kind == ProviderErrorKind::Server
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Retry configuration for one remote call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Run `op` until it succeeds, fails terminally, or retries run out.
    ///
    /// Non-retriable faults are returned after the attempt that produced
    /// them. After the last retry the final fault is returned.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetrySignal + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retriable() || attempt >= self.max_retries => return Err(err),
                Err(err) => {
                    let delay = self.compute_delay(attempt, &err);
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff before retry number `attempt + 1`, with random jitter.
    pub fn compute_delay<E: RetrySignal>(&self, attempt: u32, err: &E) -> Duration {
        self.delay_with_jitter(attempt, err, jitter())
    }

    fn delay_with_jitter<E: RetrySignal>(&self, attempt: u32, err: &E, jitter: f64) -> Duration {
        let mut base = self.base_delay;
        if err.is_rate_limited() {
            base = base.max(RATE_LIMIT_FLOOR);
        } else if err.is_server_error() {
            base = base.max(SERVER_ERROR_FLOOR);
        }

        let exp = 2f64.powi(attempt.min(32) as i32);
        let secs = (base.as_secs_f64() * exp * jitter).min(MAX_DELAY.as_secs_f64());
        let mut delay = Duration::from_secs_f64(secs.max(0.0));

        if let Some(hint) = err.retry_after() {
            delay = delay.max(hint);
        }
        delay.min(MAX_DELAY)
    }
}

/// Uniform in [0.5, 1.5).
fn jitter() -> f64 {
    rand::thread_rng().gen_range(0.5..1.5)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Fault {
        retriable: bool,
        rate_limited: bool,
        server: bool,
        retry_after: Option<Duration>,
    }

    impl Fault {
        fn transient() -> Self {
            Self {
                retriable: true,
                rate_limited: false,
                server: false,
                retry_after: None,
            }
        }

        fn terminal() -> Self {
            Self {
                retriable: false,
                ..Self::transient()
            }
        }
    }

    impl Display for Fault {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "fault(retriable={})", self.retriable)
        }
    }

    impl RetrySignal for Fault {
        fn is_retriable(&self) -> bool {
            self.retriable
        }
        fn is_rate_limited(&self) -> bool {
            self.rate_limited
        }
        fn is_server_error(&self) -> bool {
            self.server
        }
        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<&str, Fault> = policy()
            .run(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Fault::transient())
                    } else {
                        Ok("sent")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_fault_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Fault> = policy()
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Fault::terminal()) }
            })
            .await;

        assert!(!result.unwrap_err().retriable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Fault> = policy()
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Fault::transient()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_means_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), Fault> = RetryPolicy::new(0, Duration::from_millis(10))
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(Fault::transient()) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_grows_exponentially() {
        let p = policy();
        let f = Fault::transient();
        assert_eq!(p.delay_with_jitter(0, &f, 1.0), Duration::from_millis(100));
        assert_eq!(p.delay_with_jitter(1, &f, 1.0), Duration::from_millis(200));
        assert_eq!(p.delay_with_jitter(3, &f, 1.0), Duration::from_millis(800));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = policy();
        let f = Fault::transient();
        for _ in 0..200 {
            let d = p.compute_delay(2, &f);
            assert!(d >= Duration::from_millis(200), "{d:?}");
            assert!(d < Duration::from_millis(600), "{d:?}");
        }
    }

    #[test]
    fn rate_limit_and_server_floors() {
        let p = policy();
        let rate_limited = Fault {
            rate_limited: true,
            ..Fault::transient()
        };
        let server = Fault {
            server: true,
            ..Fault::transient()
        };
        assert_eq!(p.delay_with_jitter(0, &rate_limited, 1.0), RATE_LIMIT_FLOOR);
        assert_eq!(p.delay_with_jitter(0, &server, 1.0), SERVER_ERROR_FLOOR);

        // A larger configured base is not lowered.
        let slow = RetryPolicy::new(3, Duration::from_secs(2));
        assert_eq!(slow.delay_with_jitter(0, &server, 1.0), Duration::from_secs(2));
    }

    #[test]
    fn retry_after_is_a_minimum_and_cap_applies() {
        let p = policy();
        let hinted = Fault {
            retry_after: Some(Duration::from_secs(5)),
            ..Fault::transient()
        };
        assert_eq!(p.delay_with_jitter(0, &hinted, 1.0), Duration::from_secs(5));

        let huge_hint = Fault {
            retry_after: Some(Duration::from_secs(600)),
            ..Fault::transient()
        };
        assert_eq!(p.delay_with_jitter(0, &huge_hint, 1.0), MAX_DELAY);
        assert_eq!(p.delay_with_jitter(20, &Fault::transient(), 1.4), MAX_DELAY);
    }

    #[test]
    fn provider_errors_carry_signals() {
        let e = ProviderError::from_status(429, "", Some(Duration::from_secs(3)));
        assert!(e.is_retriable() && e.is_rate_limited() && !e.is_server_error());
        assert_eq!(RetrySignal::retry_after(&e), Some(Duration::from_secs(3)));

        let e = ProviderError::from_status(503, "", None);
        assert!(e.is_retriable() && e.is_server_error());

        let e = ProviderError::from_status(422, "", None);
        assert!(!e.is_retriable());
    }
}
