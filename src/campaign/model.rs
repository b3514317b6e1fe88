//! Campaign data model: recipients, delivery outcomes and the event feed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;

/// Provider tag on outcomes produced in dry-run mode.
pub const DRY_RUN_PROVIDER: &str = "dry-run";

/// Fixed reason codes for sends rejected locally by policy.
pub mod reason {
    pub const DAILY_LIMIT: &str = "daily-limit";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const SUPPRESSED: &str = "suppressed";
}

/// One addressee of a campaign plus the variables used to personalise the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    /// Template variables. Order is not significant.
    #[serde(flatten)]
    pub variables: HashMap<String, String>,
}

impl Recipient {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            variables: HashMap::new(),
        }
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Template variables with `email` always available.
    pub fn template_vars(&self) -> HashMap<String, String> {
        let mut vars = self.variables.clone();
        vars.entry("email".to_string())
            .or_insert_with(|| self.email.clone());
        vars
    }
}

/// Result of exactly one send attempt.
///
/// Created once per worker and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub email: String,
    pub success: bool,
    /// HTTP status of the final attempt, 0 when no network call happened.
    pub status_code: u16,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub provider: String,
    pub completed_at: DateTime<Utc>,
}

impl DeliveryOutcome {
    /// A message the provider accepted.
    pub fn sent(
        email: impl Into<String>,
        provider: impl Into<String>,
        status_code: u16,
        message_id: Option<String>,
    ) -> Self {
        Self {
            email: email.into(),
            success: true,
            status_code,
            message_id,
            error: None,
            provider: provider.into(),
            completed_at: Utc::now(),
        }
    }

    /// A failed attempt.
    pub fn failed(
        email: impl Into<String>,
        provider: impl Into<String>,
        status_code: u16,
        error: impl Into<String>,
    ) -> Self {
        Self {
            email: email.into(),
            success: false,
            status_code,
            message_id: None,
            error: Some(error.into()),
            provider: provider.into(),
            completed_at: Utc::now(),
        }
    }

    /// Rejected locally before any network call.
    pub fn rejected(email: impl Into<String>, provider: impl Into<String>, reason: &str) -> Self {
        Self::failed(email, provider, 0, reason)
    }

    /// Dry-run success: the full pipeline ran except the remote call.
    pub fn dry_run(email: impl Into<String>) -> Self {
        Self::sent(email, DRY_RUN_PROVIDER, 0, None)
    }
}

/// Why a run ended without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The cancellation flag was raised.
    Cancelled,
    /// A worker died in a way that could not be turned into an outcome.
    Fatal,
}

/// Events produced by a campaign run, in completion order.
///
/// A run yields any number of `Progress` events followed by exactly one
/// `Finished` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CampaignEvent {
    Progress {
        outcome: DeliveryOutcome,
        stats: StatsSnapshot,
    },
    Finished {
        stats: StatsSnapshot,
    },
    Error {
        reason: AbortReason,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        stats: StatsSnapshot,
    },
}

impl CampaignEvent {
    pub fn stats(&self) -> &StatsSnapshot {
        match self {
            Self::Progress { stats, .. } | Self::Finished { stats } | Self::Error { stats, .. } => {
                stats
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_from_flat_json() {
        let r: Recipient =
            serde_json::from_str(r#"{"email":"a@example.com","name":"Ada","plan":"pro"}"#)
                .unwrap();
        assert_eq!(r.email, "a@example.com");
        assert_eq!(r.variables.get("name").map(String::as_str), Some("Ada"));
        assert_eq!(r.variables.len(), 2);
    }

    #[test]
    fn template_vars_include_email() {
        let r = Recipient::new("a@example.com").with_var("name", "Ada");
        let vars = r.template_vars();
        assert_eq!(vars["email"], "a@example.com");
        assert_eq!(vars["name"], "Ada");
    }

    #[test]
    fn dry_run_outcome_has_no_status() {
        let o = DeliveryOutcome::dry_run("a@example.com");
        assert!(o.success);
        assert_eq!(o.provider, DRY_RUN_PROVIDER);
        assert_eq!(o.status_code, 0);
    }

    #[test]
    fn event_wire_format() {
        let event = CampaignEvent::Error {
            reason: AbortReason::Cancelled,
            message: None,
            stats: StatsSnapshot::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["reason"], "cancelled");
        assert!(json.get("message").is_none());
        assert!(event.is_terminal());

        let event = CampaignEvent::Progress {
            outcome: DeliveryOutcome::rejected("a@example.com", "resend", reason::DAILY_LIMIT),
            stats: StatsSnapshot::default(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["outcome"]["error"], "daily-limit");
        assert!(!event.is_terminal());
    }
}
