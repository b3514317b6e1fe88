//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! On first run against a database written by the earlier mailer (tables
//! exist, no `_migrations` table) it patches the old tables in place and
//! seeds V1 instead of re-creating them.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL,
                success INTEGER NOT NULL,
                status_code INTEGER NOT NULL DEFAULT 0,
                message_id TEXT,
                error TEXT,
                provider TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_email ON deliveries(email);
            CREATE INDEX IF NOT EXISTS idx_deliveries_created_at ON deliveries(created_at);

            CREATE TABLE IF NOT EXISTS suppressions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                reason TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS daily_quota (
                date TEXT PRIMARY KEY,
                used_count INTEGER NOT NULL DEFAULT 0,
                limit_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT
            );

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                event_type TEXT NOT NULL,
                message_id TEXT,
                recipient TEXT,
                payload TEXT,
                received_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_events_recipient ON events(recipient);
            CREATE INDEX IF NOT EXISTS idx_events_message_id ON events(message_id);
        "#,
    },
    Migration {
        version: 2,
        name: "delivery_run_id",
        sql: r#"
            ALTER TABLE deliveries ADD COLUMN run_id TEXT;
            CREATE INDEX IF NOT EXISTS idx_deliveries_run_id ON deliveries(run_id);
        "#,
    },
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let mut current_version = get_current_version(conn).await?;

    if current_version == 0 && table_exists(conn, "deliveries").await? {
        upgrade_legacy(conn).await?;
        seed_version(conn, 1, "initial_schema").await?;
        current_version = 1;
        tracing::info!("Legacy database detected, seeded migration V1");
    }

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Bring tables written by the earlier mailer up to the V1 shape.
///
/// The old `events` table stored `(type, email, data)`; it is kept as
/// `events_legacy` and a fresh `events` table is created in its place.
async fn upgrade_legacy(conn: &Connection) -> Result<(), DatabaseError> {
    if table_exists(conn, "events").await? && !column_exists(conn, "events", "event_type").await? {
        conn.execute("ALTER TABLE events RENAME TO events_legacy", ())
            .await
            .map_err(|e| {
                DatabaseError::Migration(format!("Failed to set aside legacy events table: {e}"))
            })?;
    }

    // Idempotent column additions for tables that predate them.
    let additions = [
        ("suppressions", "detail", "ALTER TABLE suppressions ADD COLUMN detail TEXT"),
        (
            "suppressions",
            "updated_at",
            "ALTER TABLE suppressions ADD COLUMN updated_at TEXT",
        ),
        (
            "daily_quota",
            "updated_at",
            "ALTER TABLE daily_quota ADD COLUMN updated_at TEXT",
        ),
    ];
    for (table, column, sql) in additions {
        if table_exists(conn, table).await? && !column_exists(conn, table, column).await? {
            conn.execute(sql, ()).await.map_err(|e| {
                DatabaseError::Migration(format!("Failed to add {table}.{column}: {e}"))
            })?;
        }
    }

    // Everything in V1 is CREATE ... IF NOT EXISTS, so this only fills gaps.
    conn.execute_batch(MIGRATIONS[0].sql)
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to complete legacy schema: {e}")))?;
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn table_exists(conn: &Connection, table: &str) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
            libsql::params![table],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to check table {table}: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
        Ok(None) => Ok(false),
        Err(e) => Err(DatabaseError::Query(format!("Failed to check table {table}: {e}"))),
    }
}

async fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name=?2",
            libsql::params![table, column],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to inspect {table}: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
        Ok(None) => Ok(false),
        Err(e) => Err(DatabaseError::Query(format!("Failed to inspect {table}: {e}"))),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
