//! Error types for the campaign mailer.

use std::time::Duration;

/// Top-level error type for the mailer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Preflight failed: {}", .0.join("; "))]
    Preflight(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Classification of a failed provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    Server,
    /// HTTP 401.
    Unauthorized,
    /// HTTP 422.
    Validation,
    /// Any other non-success status.
    Rejected,
    /// Connection, TLS or timeout failure before a status was received.
    Network,
}

/// A failed call to the upstream email API.
///
/// Carries everything the retry policy needs to decide what to do next,
/// so callers never have to inspect the message text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
    pub retriable: bool,
    pub message: String,
}

/// Longest provider error text kept on an outcome.
const MAX_ERROR_TEXT: usize = 200;

impl ProviderError {
    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, detail: &str, retry_after: Option<Duration>) -> Self {
        let detail: String = detail.chars().take(MAX_ERROR_TEXT).collect();
        let (kind, message) = match status {
            429 => (
                ProviderErrorKind::RateLimited,
                format!("Rate limited (429): {detail}"),
            ),
            500..=599 => (
                ProviderErrorKind::Server,
                format!("Server error ({status}): {detail}"),
            ),
            401 => (
                ProviderErrorKind::Unauthorized,
                "Unauthorized (401) - check RESEND_API_KEY".to_string(),
            ),
            422 => (
                ProviderErrorKind::Validation,
                format!("Validation error (422): {detail}"),
            ),
            _ => (
                ProviderErrorKind::Rejected,
                format!("Request rejected ({status}): {detail}"),
            ),
        };
        let retriable = matches!(
            kind,
            ProviderErrorKind::RateLimited | ProviderErrorKind::Server
        );
        Self {
            kind,
            status_code: Some(status),
            retry_after: if retriable { retry_after } else { None },
            retriable,
            message,
        }
    }

    /// A transport failure: no status was received. Always retriable.
    pub fn network(detail: impl std::fmt::Display) -> Self {
        Self {
            kind: ProviderErrorKind::Network,
            status_code: None,
            retry_after: None,
            retriable: true,
            message: format!("Network error: {detail}"),
        }
    }
}

/// Template rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Missing variable '{variable}' in template {template}")]
    MissingVariable { template: String, variable: String },

    #[error("Failed to load templates: {0}")]
    Load(String),
}

/// Campaign-level control faults. These abort the run instead of
/// becoming a per-recipient outcome.
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign cancelled")]
    Cancelled,
}

/// Result type alias for the mailer.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let e = ProviderError::from_status(429, "slow down", Some(Duration::from_secs(2)));
        assert_eq!(e.kind, ProviderErrorKind::RateLimited);
        assert!(e.retriable);
        assert_eq!(e.retry_after, Some(Duration::from_secs(2)));

        for status in [500, 502, 503, 504] {
            let e = ProviderError::from_status(status, "boom", None);
            assert_eq!(e.kind, ProviderErrorKind::Server);
            assert!(e.retriable);
        }

        let e = ProviderError::from_status(401, "bad key", None);
        assert_eq!(e.kind, ProviderErrorKind::Unauthorized);
        assert!(!e.retriable);
        assert!(e.message.contains("RESEND_API_KEY"));

        let e = ProviderError::from_status(422, "invalid to", None);
        assert_eq!(e.kind, ProviderErrorKind::Validation);
        assert!(!e.retriable);

        let e = ProviderError::from_status(403, "forbidden", Some(Duration::from_secs(9)));
        assert_eq!(e.kind, ProviderErrorKind::Rejected);
        assert!(!e.retriable);
        assert_eq!(e.retry_after, None);
    }

    #[test]
    fn network_errors_are_retriable() {
        let e = ProviderError::network("connection reset");
        assert!(e.retriable);
        assert_eq!(e.status_code, None);
        assert_eq!(e.to_string(), "Network error: connection reset");
    }

    #[test]
    fn detail_is_truncated() {
        let long = "x".repeat(500);
        let e = ProviderError::from_status(400, &long, None);
        assert!(e.message.len() < 250);
    }
}
