//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::campaign::model::DeliveryOutcome;
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, DeliveryRecord, DeliveryTotals};
use crate::suppression::{SuppressionEntry, SuppressionReason, WebhookEvent};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_deliveries(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match row_to_delivery(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping delivery row: {e}"),
            }
        }
        Ok(records)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const DELIVERY_COLUMNS: &str =
    "id, run_id, email, success, status_code, message_id, error, provider, timestamp";

const SUPPRESSION_COLUMNS: &str = "email, reason, detail, created_at, updated_at";

const EVENT_COLUMNS: &str = "id, provider, event_type, message_id, recipient, payload, received_at";

fn row_to_delivery(row: &libsql::Row) -> Result<DeliveryRecord, libsql::Error> {
    let run_id = row
        .get::<String>(1)
        .ok()
        .and_then(|s| Uuid::parse_str(&s).ok());
    let completed_at = row
        .get::<String>(8)
        .map(|s| parse_datetime(&s))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    Ok(DeliveryRecord {
        id: row.get(0)?,
        run_id,
        outcome: DeliveryOutcome {
            email: row.get(2)?,
            success: row.get::<i64>(3)? != 0,
            status_code: row.get::<i64>(4).unwrap_or(0) as u16,
            message_id: row.get(5).ok(),
            error: row.get(6).ok(),
            provider: row.get::<String>(7).unwrap_or_default(),
            completed_at,
        },
    })
}

fn row_to_suppression(row: &libsql::Row) -> Result<SuppressionEntry, libsql::Error> {
    let created_at = row
        .get::<String>(3)
        .map(|s| parse_datetime(&s))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let updated_at = row
        .get::<String>(4)
        .map(|s| parse_datetime(&s))
        .unwrap_or(created_at);

    Ok(SuppressionEntry {
        email: row.get(0)?,
        // Rows written without a reason still block sends.
        reason: row
            .get::<String>(1)
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or(SuppressionReason::Manual),
        detail: row.get(2).ok(),
        created_at,
        updated_at,
    })
}

fn row_to_event(row: &libsql::Row) -> Result<WebhookEvent, libsql::Error> {
    let payload = row
        .get::<String>(5)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(serde_json::Value::Null);
    Ok(WebhookEvent {
        id: Some(row.get(0)?),
        provider: row.get(1)?,
        event_type: row.get(2)?,
        message_id: row.get(3).ok(),
        recipient: row.get(4).ok(),
        payload,
        received_at: parse_datetime(&row.get::<String>(6)?),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Deliveries ──────────────────────────────────────────────────

    async fn record_delivery(
        &self,
        run_id: Option<Uuid>,
        outcome: &DeliveryOutcome,
    ) -> Result<i64, DatabaseError> {
        let run_id = run_id.map(|id| id.to_string());
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO deliveries (run_id, email, success, status_code, message_id, error, provider, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) RETURNING id",
                params![
                    opt_text(run_id.as_deref()),
                    outcome.email.as_str(),
                    outcome.success as i64,
                    outcome.status_code as i64,
                    opt_text(outcome.message_id.as_deref()),
                    opt_text(outcome.error.as_deref()),
                    outcome.provider.as_str(),
                    outcome.completed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_delivery: {e}")))?;

        let id = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("record_delivery id: {e}")))?,
            Ok(None) => {
                return Err(DatabaseError::Query(
                    "record_delivery: no row id returned".to_string(),
                ));
            }
            Err(e) => return Err(DatabaseError::Query(format!("record_delivery: {e}"))),
        };

        debug!(id, email = %outcome.email, success = outcome.success, "Delivery recorded");
        Ok(id)
    }

    async fn recent_deliveries(&self, limit: usize) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        self.query_deliveries(
            "recent_deliveries",
            &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries ORDER BY id DESC LIMIT ?1"),
            params![limit as i64],
        )
        .await
    }

    async fn deliveries_for(&self, email: &str) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        self.query_deliveries(
            "deliveries_for",
            &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE email = ?1 ORDER BY id DESC"),
            params![email],
        )
        .await
    }

    async fn deliveries_for_run(&self, run_id: Uuid) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        self.query_deliveries(
            "deliveries_for_run",
            &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE run_id = ?1 ORDER BY id ASC"),
            params![run_id.to_string()],
        )
        .await
    }

    async fn delivery_totals(&self) -> Result<DeliveryTotals, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) FROM deliveries",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delivery_totals: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let total = row.get::<i64>(0).unwrap_or(0) as u64;
                let succeeded = row.get::<i64>(1).unwrap_or(0) as u64;
                Ok(DeliveryTotals {
                    total,
                    succeeded,
                    failed: total.saturating_sub(succeeded),
                })
            }
            Ok(None) => Ok(DeliveryTotals::default()),
            Err(e) => Err(DatabaseError::Query(format!("delivery_totals: {e}"))),
        }
    }

    async fn prune_deliveries(&self, keep_recent: usize) -> Result<u64, DatabaseError> {
        let deleted = self
            .conn()
            .execute(
                "DELETE FROM deliveries WHERE id NOT IN (SELECT id FROM deliveries ORDER BY id DESC LIMIT ?1)",
                params![keep_recent as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_deliveries: {e}")))?;

        if deleted > 0 {
            info!(deleted, keep_recent, "Pruned old deliveries");
        }
        Ok(deleted)
    }

    // ── Suppressions ────────────────────────────────────────────────

    async fn upsert_suppression(
        &self,
        email: &str,
        reason: SuppressionReason,
        detail: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO suppressions (email, reason, detail, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4) \
                 ON CONFLICT(email) DO UPDATE SET reason = excluded.reason, detail = excluded.detail, updated_at = excluded.updated_at",
                params![email, reason.as_str(), opt_text(detail), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_suppression: {e}")))?;

        debug!(email, reason = reason.as_str(), "Suppression upserted");
        Ok(())
    }

    async fn get_suppression(&self, email: &str) -> Result<Option<SuppressionEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUPPRESSION_COLUMNS} FROM suppressions WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_suppression: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_suppression(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_suppression row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_suppression: {e}"))),
        }
    }

    async fn remove_suppression(&self, email: &str) -> Result<bool, DatabaseError> {
        let removed = self
            .conn()
            .execute("DELETE FROM suppressions WHERE email = ?1", params![email])
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_suppression: {e}")))?;
        Ok(removed > 0)
    }

    async fn list_suppressions(&self) -> Result<Vec<SuppressionEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SUPPRESSION_COLUMNS} FROM suppressions ORDER BY email ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_suppressions: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_suppression(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping suppression row: {e}"),
            }
        }
        Ok(entries)
    }

    // ── Daily quota ─────────────────────────────────────────────────

    async fn load_quota(&self, day: NaiveDate) -> Result<Option<u32>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT used_count FROM daily_quota WHERE date = ?1",
                params![day.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("load_quota: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<i64>(0).unwrap_or(0).max(0) as u32)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("load_quota: {e}"))),
        }
    }

    async fn save_quota(&self, day: NaiveDate, used: u32, limit: u32) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO daily_quota (date, used_count, limit_count, updated_at) VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(date) DO UPDATE SET used_count = excluded.used_count, limit_count = excluded.limit_count, updated_at = excluded.updated_at",
                params![day.to_string(), used as i64, limit as i64, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_quota: {e}")))?;
        Ok(())
    }

    // ── Provider events ─────────────────────────────────────────────

    async fn record_event(&self, event: &WebhookEvent) -> Result<i64, DatabaseError> {
        let payload = serde_json::to_string(&event.payload)
            .map_err(|e| DatabaseError::Serialization(format!("event payload: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO events (provider, event_type, message_id, recipient, payload, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
                params![
                    event.provider.as_str(),
                    event.event_type.as_str(),
                    opt_text(event.message_id.as_deref()),
                    opt_text(event.recipient.as_deref()),
                    payload,
                    event.received_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_event: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("record_event id: {e}"))),
            Ok(None) => Err(DatabaseError::Query(
                "record_event: no row id returned".to_string(),
            )),
            Err(e) => Err(DatabaseError::Query(format!("record_event: {e}"))),
        }
    }

    async fn recent_events(&self, limit: usize) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY id DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_events: {e}")))?;

        let mut events = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_event(&row) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!("Skipping event row: {e}"),
            }
        }
        Ok(events)
    }
}
