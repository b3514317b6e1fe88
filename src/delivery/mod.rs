//! Outbound delivery: the provider call and the policies wrapped around it.

pub mod provider;
pub mod rate_limiter;
pub mod resend;
pub mod retry;

pub use provider::{EmailProvider, OutboundEmail, SendReceipt};
pub use rate_limiter::{RateLimitConfig, RateLimitStats, RateLimiter};
pub use resend::ResendClient;
pub use retry::{RetryPolicy, RetrySignal};
