//! The upstream send call, as seen by the dispatch engine.

use async_trait::async_trait;

use crate::error::ProviderError;

/// One fully rendered message for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// What the provider hands back for an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub status_code: u16,
    /// Provider-assigned id, when the response carried one.
    pub message_id: Option<String>,
}

/// A transactional email API.
///
/// Implementations make exactly one request per call; retrying and rate
/// limiting are layered on by the caller.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Provider name recorded on every outcome (e.g. "resend").
    fn name(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, ProviderError>;
}
