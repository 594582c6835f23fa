//! Schema migration system.
//!
//! Migrations are static SQL strings keyed by version number.  Applied
//! versions are tracked in a `_migrations` table so repeated runs are
//! idempotent.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "credential pool — provider_keys table",
        sql: r#"
            CREATE TABLE provider_keys (
                id                  INTEGER PRIMARY KEY AUTOINCREMENT,
                provider            TEXT NOT NULL,
                key_name            TEXT,
                api_key             TEXT NOT NULL,
                tier                TEXT NOT NULL DEFAULT 'basic' CHECK(tier IN ('basic','production')),
                is_default          BOOLEAN NOT NULL DEFAULT 0,
                is_active           BOOLEAN NOT NULL DEFAULT 1,
                rate_limit_reset_at INTEGER,
                last_used_at        INTEGER,
                last_error_at       INTEGER,
                error_count         INTEGER NOT NULL DEFAULT 0,
                created_at          INTEGER NOT NULL
            );
            CREATE INDEX idx_provider_keys_provider ON provider_keys(provider, is_active);
        "#,
    },
    Migration {
        version: 2,
        description: "usage counters — api_usage table with per-minute buckets",
        sql: r#"
            CREATE TABLE api_usage (
                caller           TEXT NOT NULL,
                role             TEXT NOT NULL DEFAULT 'visitor',
                provider         TEXT NOT NULL,
                model            TEXT NOT NULL,
                kind             TEXT NOT NULL DEFAULT 'chat' CHECK(kind IN ('chat','speech')),
                day              TEXT NOT NULL,
                minute_bucket    INTEGER NOT NULL,
                request_count    INTEGER NOT NULL DEFAULT 0,
                token_count      INTEGER NOT NULL DEFAULT 0,
                fallback_count   INTEGER NOT NULL DEFAULT 0,
                latency_ms_total INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (caller, provider, model, kind, day, minute_bucket)
            );
            CREATE INDEX idx_api_usage_org ON api_usage(provider, model, kind, day);
            CREATE INDEX idx_api_usage_bucket ON api_usage(minute_bucket);
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function — call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Create the `_migrations` bookkeeping table if it does not exist.
fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────
