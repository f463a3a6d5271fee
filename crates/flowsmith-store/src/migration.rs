//! Schema migrations.
//!
//! Migrations are static SQL strings keyed by version. Applied versions
//! are recorded in a `_migrations` table so each runs exactly once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

/// All migrations in order. Append new ones to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "saved flows and automations",
        sql: r#"
            CREATE TABLE saved_flows (
                id                TEXT PRIMARY KEY,
                name              TEXT NOT NULL,
                description       TEXT,
                prompt            TEXT NOT NULL,
                flow              TEXT NOT NULL,
                intent            TEXT,
                validation_score  INTEGER,
                execution_count   INTEGER NOT NULL DEFAULT 0,
                last_executed_at  INTEGER,
                created_at        INTEGER NOT NULL,
                updated_at        INTEGER NOT NULL
            );

            CREATE TABLE automations (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                flow             TEXT NOT NULL,
                cadence_minutes  INTEGER NOT NULL CHECK(cadence_minutes >= 1),
                enabled          BOOLEAN NOT NULL DEFAULT 1,
                last_run_at      INTEGER,
                last_outcome     TEXT NOT NULL DEFAULT 'never_run'
                                 CHECK(last_outcome IN ('never_run','success','partial_failure','failure')),
                next_due_at      INTEGER NOT NULL,
                run_count        INTEGER NOT NULL DEFAULT 0,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );
            CREATE INDEX idx_automations_due ON automations(enabled, next_due_at);
        "#,
    },
    Migration {
        version: 2,
        description: "append-only learning log",
        sql: r#"
            CREATE TABLE learning_records (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at  INTEGER NOT NULL,
                prompt       TEXT NOT NULL,
                intent       TEXT,
                flow_id      TEXT,
                flow         TEXT,
                validation   TEXT,
                score        INTEGER,
                verdict      TEXT CHECK(verdict IS NULL OR verdict IN ('accepted','accepted_with_warnings','rejected')),
                error        TEXT
            );
            CREATE INDEX idx_learning_records_recorded ON learning_records(recorded_at);

            CREATE TRIGGER learning_records_no_update
            BEFORE UPDATE ON learning_records
            BEGIN
                SELECT RAISE(ABORT, 'learning records are append-only');
            END;

            CREATE TRIGGER learning_records_no_delete
            BEFORE DELETE ON learning_records
            BEGIN
                SELECT RAISE(ABORT, 'learning records are append-only');
            END;
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// Synchronous; call it through [`crate::Database::run_migrations`].
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
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to read current version: {e}"),
    })
}

// ── internals ────────────────────────────────────────────────────────

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
    })
}

/// Apply one migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    let fail = |message: String| StoreError::Migration {
        version: migration.version,
        message,
    };

    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| fail(format!("failed to begin transaction: {e}")))?;

    let result = conn
        .execute_batch(migration.sql)
        .map_err(|e| fail(format!("SQL execution failed: {e}")))
        .and_then(|()| {
            conn.execute(
                "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![
                    migration.version,
                    migration.description,
                    chrono::Utc::now().timestamp()
                ],
            )
            .map(|_| ())
            .map_err(|e| fail(format!("failed to record migration: {e}")))
        });

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| fail(format!("failed to commit: {e}")))?;
            Ok(())
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const LATEST_VERSION: u32 = 2;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        conn
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(window[1].version > window[0].version);
        }
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = migrated();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), LATEST_VERSION);
    }

    #[test]
    fn cadence_below_one_minute_is_rejected_by_schema() {
        let conn = migrated();
        let result = conn.execute(
            "INSERT INTO automations (id, name, flow, cadence_minutes, next_due_at, created_at, updated_at) \
             VALUES ('a', 'a', '{}', 0, 0, 0, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn unknown_outcome_is_rejected_by_schema() {
        let conn = migrated();
        let result = conn.execute(
            "INSERT INTO automations (id, name, flow, cadence_minutes, last_outcome, next_due_at, created_at, updated_at) \
             VALUES ('a', 'a', '{}', 5, 'exploded', 0, 0, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn learning_records_reject_update_and_delete() {
        let conn = migrated();
        conn.execute(
            "INSERT INTO learning_records (recorded_at, prompt) VALUES (1, 'hello')",
            [],
        )
        .unwrap();

        let update = conn.execute("UPDATE learning_records SET prompt = 'changed'", []);
        assert!(update.is_err());

        let delete = conn.execute("DELETE FROM learning_records", []);
        assert!(delete.is_err());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM learning_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
