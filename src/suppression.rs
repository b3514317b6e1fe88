//! Do-not-send list.
//!
//! Addresses are normalised (trimmed, lower-cased) before every lookup and
//! write. Unsubscribes and hard blocks share one table but are reported
//! separately so outcomes carry the right reason code.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::store::Database;

/// Why an address is on the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    Unsubscribed,
    Bounced,
    Complaint,
    Manual,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
            Self::Complaint => "complaint",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuppressionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            // Older databases wrote the verb.
            "unsubscribed" | "unsubscribe" => Ok(Self::Unsubscribed),
            "bounced" | "bounce" => Ok(Self::Bounced),
            "complaint" | "complained" => Ok(Self::Complaint),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown suppression reason: {other}")),
        }
    }
}

/// One suppressed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuppressionEntry {
    pub email: String,
    pub reason: SuppressionReason,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A delivery-status callback as recorded by the webhook receiver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Row id once stored.
    pub id: Option<i64>,
    pub provider: String,
    /// Provider event name, e.g. `email.bounced`.
    pub event_type: String,
    pub message_id: Option<String>,
    pub recipient: Option<String>,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn new(
        provider: impl Into<String>,
        event_type: impl Into<String>,
        message_id: Option<String>,
        recipient: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            provider: provider.into(),
            event_type: event_type.into(),
            message_id,
            recipient,
            payload,
            received_at: Utc::now(),
        }
    }

    /// Suppression implied by this event, if any.
    pub fn implied_suppression(&self) -> Option<SuppressionReason> {
        match self.event_type.as_str() {
            "email.bounced" => Some(SuppressionReason::Bounced),
            "email.complained" => Some(SuppressionReason::Complaint),
            _ => None,
        }
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Suppression lookups and writes over the shared store.
#[derive(Clone)]
pub struct SuppressionList {
    store: Arc<dyn Database>,
}

impl SuppressionList {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// The address opted out.
    pub async fn is_unsubscribed(&self, email: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .lookup(email)
            .await?
            .is_some_and(|e| e.reason == SuppressionReason::Unsubscribed))
    }

    /// The address is blocked for bounce, complaint, or by hand.
    pub async fn is_suppressed(&self, email: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .lookup(email)
            .await?
            .is_some_and(|e| e.reason != SuppressionReason::Unsubscribed))
    }

    pub async fn lookup(&self, email: &str) -> Result<Option<SuppressionEntry>, DatabaseError> {
        self.store.get_suppression(&normalize_email(email)).await
    }

    /// Insert or replace. Last write wins.
    pub async fn add_suppression(
        &self,
        email: &str,
        reason: SuppressionReason,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let email = normalize_email(email);
        self.store.upsert_suppression(&email, reason, detail).await?;
        info!(email = %email, %reason, "Address suppressed");
        Ok(())
    }

    pub async fn add_unsubscribe(&self, email: &str) -> Result<(), DatabaseError> {
        self.add_suppression(email, SuppressionReason::Unsubscribed, None)
            .await
    }

    pub async fn remove(&self, email: &str) -> Result<bool, DatabaseError> {
        self.store.remove_suppression(&normalize_email(email)).await
    }

    pub async fn list(&self) -> Result<Vec<SuppressionEntry>, DatabaseError> {
        self.store.list_suppressions().await
    }

    /// Record a provider callback and apply the suppression it implies.
    ///
    /// Returns the stored event id.
    pub async fn ingest_event(&self, event: &WebhookEvent) -> Result<i64, DatabaseError> {
        let id = self.store.record_event(event).await?;

        match (event.implied_suppression(), event.recipient.as_deref()) {
            (Some(reason), Some(recipient)) => {
                let detail = event
                    .message_id
                    .as_deref()
                    .map(|m| format!("{} for {m}", event.event_type));
                self.add_suppression(recipient, reason, detail.as_deref())
                    .await?;
            }
            (Some(_), None) => {
                warn!(event_id = id, event_type = %event.event_type, "Event has no recipient, nothing suppressed");
            }
            (None, _) => {}
        }
        Ok(id)
    }
}
