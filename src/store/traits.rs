//! Backend-agnostic `Database` trait: the read/write contract the dispatch
//! engine and its collaborators need.

use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::campaign::model::DeliveryOutcome;
use crate::error::DatabaseError;
use crate::suppression::{SuppressionEntry, SuppressionReason, WebhookEvent};

/// A persisted delivery outcome.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub id: i64,
    /// Campaign run that produced this outcome. `None` for rows written
    /// before runs were tracked.
    pub run_id: Option<Uuid>,
    pub outcome: DeliveryOutcome,
}

/// Aggregate success/failure counts over the whole delivery log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryTotals {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl DeliveryTotals {
    /// Fraction of deliveries that succeeded, 0.0 when nothing was sent.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }
}

/// Single async interface for all persistence.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Deliveries ──────────────────────────────────────────────────

    /// Append one outcome. Returns the new row id.
    async fn record_delivery(
        &self,
        run_id: Option<Uuid>,
        outcome: &DeliveryOutcome,
    ) -> Result<i64, DatabaseError>;

    /// Most recent deliveries first.
    async fn recent_deliveries(&self, limit: usize) -> Result<Vec<DeliveryRecord>, DatabaseError>;

    /// Every delivery for one address, most recent first.
    async fn deliveries_for(&self, email: &str) -> Result<Vec<DeliveryRecord>, DatabaseError>;

    /// Deliveries belonging to one campaign run.
    async fn deliveries_for_run(&self, run_id: Uuid) -> Result<Vec<DeliveryRecord>, DatabaseError>;

    async fn delivery_totals(&self) -> Result<DeliveryTotals, DatabaseError>;

    /// Delete all but the `keep_recent` newest rows. Returns the number deleted.
    async fn prune_deliveries(&self, keep_recent: usize) -> Result<u64, DatabaseError>;

    // ── Suppressions ────────────────────────────────────────────────

    /// Insert or replace the entry for `email`. Last write wins.
    async fn upsert_suppression(
        &self,
        email: &str,
        reason: SuppressionReason,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn get_suppression(&self, email: &str) -> Result<Option<SuppressionEntry>, DatabaseError>;

    /// Returns true if an entry was removed.
    async fn remove_suppression(&self, email: &str) -> Result<bool, DatabaseError>;

    async fn list_suppressions(&self) -> Result<Vec<SuppressionEntry>, DatabaseError>;

    // ── Daily quota ─────────────────────────────────────────────────

    /// Persisted used count for `day`, if any was ever written.
    async fn load_quota(&self, day: NaiveDate) -> Result<Option<u32>, DatabaseError>;

    async fn save_quota(&self, day: NaiveDate, used: u32, limit: u32) -> Result<(), DatabaseError>;

    // ── Provider events ─────────────────────────────────────────────

    async fn record_event(&self, event: &WebhookEvent) -> Result<i64, DatabaseError>;

    async fn recent_events(&self, limit: usize) -> Result<Vec<WebhookEvent>, DatabaseError>;
}
