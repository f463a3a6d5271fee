//! Automation persistence.
//!
//! The `automations` table is the single source of truth for scheduling
//! state. Every mutation is one targeted `UPDATE`, so concurrent writers
//! (the scheduler and API calls) touching different columns of the same
//! record never overwrite each other. Advancing `next_due_at` is a
//! compare-and-set on the previous value.
//!
//! Timestamps are supplied by the caller so that scheduling logic can run
//! against an injected clock.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A persisted automation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredAutomation {
    /// Unique identifier (UUID v7).
    pub id: String,
    pub name: String,
    /// JSON snapshot of the owning flow model.
    pub flow: serde_json::Value,
    /// Interval between runs, in whole minutes (always >= 1).
    pub cadence_minutes: i64,
    pub enabled: bool,
    /// Unix timestamp of the last completed run.
    pub last_run_at: Option<i64>,
    /// One of `never_run`, `success`, `partial_failure`, `failure`.
    pub last_outcome: String,
    /// Unix timestamp at which the next run is due.
    pub next_due_at: i64,
    /// Number of completed runs.
    pub run_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

// ═══════════════════════════════════════════════════════════════════════
//  AutomationStore
// ═══════════════════════════════════════════════════════════════════════

const SELECT_COLUMNS: &str = "SELECT id, name, flow, cadence_minutes, enabled, last_run_at, last_outcome, \
     next_due_at, run_count, created_at, updated_at FROM automations";

/// CRUD and scheduling-state updates for automations.
#[derive(Clone)]
pub struct AutomationStore {
    db: Database,
}

impl AutomationStore {
    /// Create a new automation store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new enabled automation that has never run.
    #[instrument(skip(self, flow))]
    pub async fn create(
        &self,
        name: &str,
        flow: serde_json::Value,
        cadence_minutes: i64,
        next_due_at: i64,
        now: i64,
    ) -> StoreResult<StoredAutomation> {
        if cadence_minutes < 1 {
            return Err(StoreError::InvalidArgument(format!(
                "cadence must be at least one minute, got {cadence_minutes}"
            )));
        }

        let automation = StoredAutomation {
            id: Uuid::now_v7().to_string(),
            name: name.to_string(),
            flow,
            cadence_minutes,
            enabled: true,
            last_run_at: None,
            last_outcome: "never_run".to_string(),
            next_due_at,
            run_count: 0,
            created_at: now,
            updated_at: now,
        };

        let flow_json = serde_json::to_string(&automation.flow)?;
        let (id, name) = (automation.id.clone(), automation.name.clone());
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO automations (id, name, flow, cadence_minutes, enabled, last_outcome, next_due_at, run_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, 1, 'never_run', ?5, 0, ?6, ?6)",
                    rusqlite::params![id, name, flow_json, cadence_minutes, next_due_at, now],
                )?;
                Ok(())
            })
            .await?;

        debug!(automation_id = %automation.id, "automation created");
        Ok(automation)
    }

    /// Fetch an automation by id.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Option<StoredAutomation>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    rusqlite::params![id],
                    AutomationRow::from_row,
                );
                match result {
                    Ok(row) => row.into_stored_automation().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// List every automation in creation order.
    #[instrument(skip(self))]
    pub async fn list(&self) -> StoreResult<Vec<StoredAutomation>> {
        self.query_many(format!("{SELECT_COLUMNS} ORDER BY created_at, id"), None)
            .await
    }

    /// List enabled automations whose next run is due at or before `now`,
    /// most overdue first.
    #[instrument(skip(self))]
    pub async fn list_due(&self, now: i64) -> StoreResult<Vec<StoredAutomation>> {
        self.query_many(
            format!("{SELECT_COLUMNS} WHERE enabled = 1 AND next_due_at <= ?1 ORDER BY next_due_at, id"),
            Some(now),
        )
        .await
    }

    /// Enable or disable an automation. `next_due_at` is left untouched.
    #[instrument(skip(self))]
    pub async fn set_enabled(&self, id: &str, enabled: bool, now: i64) -> StoreResult<()> {
        self.update_one(
            id,
            "UPDATE automations SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            (enabled, now),
        )
        .await
    }

    /// Move `next_due_at` from `expected` to `next`.
    ///
    /// Returns `false` without writing when the stored value no longer
    /// equals `expected` (another writer advanced it first) or the record
    /// is gone.
    #[instrument(skip(self))]
    pub async fn advance_next_due(
        &self,
        id: &str,
        expected: i64,
        next: i64,
        now: i64,
    ) -> StoreResult<bool> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE automations SET next_due_at = ?3, updated_at = ?4 \
                     WHERE id = ?1 AND next_due_at = ?2",
                    rusqlite::params![id, expected, next, now],
                )?;
                Ok(updated == 1)
            })
            .await
    }

    /// Overwrite `next_due_at` unconditionally (startup reconciliation).
    #[instrument(skip(self))]
    pub async fn set_next_due(&self, id: &str, next: i64, now: i64) -> StoreResult<()> {
        self.update_one(
            id,
            "UPDATE automations SET next_due_at = ?2, updated_at = ?3 WHERE id = ?1",
            (next, now),
        )
        .await
    }

    /// Record a completed run: last-run time, outcome, and run count.
    ///
    /// Touches neither `enabled` nor `next_due_at`.
    #[instrument(skip(self))]
    pub async fn record_run(&self, id: &str, ran_at: i64, outcome: &str) -> StoreResult<()> {
        let id = id.to_string();
        let outcome = outcome.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE automations SET last_run_at = ?2, last_outcome = ?3, \
                     run_count = run_count + 1, updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, ran_at, outcome],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "automation",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Delete an automation.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM automations WHERE id = ?1", rusqlite::params![id])?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "automation",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Total number of automations, and how many of them are enabled.
    pub async fn counts(&self) -> StoreResult<(i64, i64)> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM automations",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?)
            })
            .await
    }

    // ── helpers ──────────────────────────────────────────────────────

    async fn query_many(&self, sql: String, now: Option<i64>) -> StoreResult<Vec<StoredAutomation>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = match now {
                    Some(now) => stmt
                        .query_map(rusqlite::params![now], AutomationRow::from_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                    None => stmt
                        .query_map([], AutomationRow::from_row)?
                        .collect::<Result<Vec<_>, _>>()?,
                };
                rows.into_iter()
                    .map(AutomationRow::into_stored_automation)
                    .collect()
            })
            .await
    }

    async fn update_one<P>(&self, id: &str, sql: &'static str, values: (P, i64)) -> StoreResult<()>
    where
        P: rusqlite::ToSql + Send + 'static,
    {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(sql, rusqlite::params![id, values.0, values.1])?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "automation",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

struct AutomationRow {
    id: String,
    name: String,
    flow: String,
    cadence_minutes: i64,
    enabled: bool,
    last_run_at: Option<i64>,
    last_outcome: String,
    next_due_at: i64,
    run_count: i64,
    created_at: i64,
    updated_at: i64,
}

impl AutomationRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            flow: row.get(2)?,
            cadence_minutes: row.get(3)?,
            enabled: row.get(4)?,
            last_run_at: row.get(5)?,
            last_outcome: row.get(6)?,
            next_due_at: row.get(7)?,
            run_count: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_stored_automation(self) -> StoreResult<StoredAutomation> {
        Ok(StoredAutomation {
            id: self.id,
            name: self.name,
            flow: serde_json::from_str(&self.flow)?,
            cadence_minutes: self.cadence_minutes,
            enabled: self.enabled,
            last_run_at: self.last_run_at,
            last_outcome: self.last_outcome,
            next_due_at: self.next_due_at,
            run_count: self.run_count,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn setup() -> AutomationStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        AutomationStore::new(db)
    }

    #[tokio::test]
    async fn create_starts_enabled_and_never_run() {
        let store = setup().await;
        let created = store
            .create("quotes", json!({"id": "flow"}), 5, 400, 100)
            .await
            .unwrap();

        assert!(created.enabled);
        assert_eq!(created.last_outcome, "never_run");
        assert_eq!(created.last_run_at, None);
        assert_eq!(created.run_count, 0);

        let fetched = store.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn create_rejects_zero_cadence() {
        let store = setup().await;
        let err = store.create("bad", json!({}), 0, 0, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn list_due_only_returns_enabled_and_due() {
        let store = setup().await;
        let due = store.create("due", json!({}), 1, 100, 0).await.unwrap();
        let later = store.create("later", json!({}), 1, 500, 0).await.unwrap();
        let disabled = store.create("off", json!({}), 1, 50, 0).await.unwrap();
        store.set_enabled(&disabled.id, false, 10).await.unwrap();

        let listed = store.list_due(200).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|a| a.id.clone()).collect();
        assert_eq!(ids, vec![due.id]);
        assert!(!ids.contains(&later.id));
    }

    #[tokio::test]
    async fn advance_next_due_is_compare_and_set() {
        let store = setup().await;
        let a = store.create("a", json!({}), 1, 100, 0).await.unwrap();

        assert!(store.advance_next_due(&a.id, 100, 160, 100).await.unwrap());
        assert!(!store.advance_next_due(&a.id, 100, 220, 101).await.unwrap());

        let fetched = store.get(&a.id).await.unwrap().unwrap();
        assert_eq!(fetched.next_due_at, 160);
    }

    #[tokio::test]
    async fn record_run_leaves_schedule_untouched() {
        let store = setup().await;
        let a = store.create("a", json!({}), 1, 100, 0).await.unwrap();
        store.set_enabled(&a.id, false, 1).await.unwrap();

        store.record_run(&a.id, 90, "partial_failure").await.unwrap();

        let fetched = store.get(&a.id).await.unwrap().unwrap();
        assert!(!fetched.enabled);
        assert_eq!(fetched.next_due_at, 100);
        assert_eq!(fetched.last_run_at, Some(90));
        assert_eq!(fetched.last_outcome, "partial_failure");
        assert_eq!(fetched.run_count, 1);
    }

    #[tokio::test]
    async fn missing_records_are_not_found() {
        let store = setup().await;
        assert!(store.set_enabled("x", true, 0).await.unwrap_err().is_not_found());
        assert!(store.record_run("x", 0, "success").await.unwrap_err().is_not_found());
        assert!(store.delete("x").await.unwrap_err().is_not_found());
        assert!(!store.advance_next_due("x", 0, 1, 0).await.unwrap());
    }

    #[tokio::test]
    async fn counts_reports_total_and_enabled() {
        let store = setup().await;
        let a = store.create("a", json!({}), 1, 0, 0).await.unwrap();
        store.create("b", json!({}), 1, 0, 0).await.unwrap();
        store.set_enabled(&a.id, false, 0).await.unwrap();

        assert_eq!(store.counts().await.unwrap(), (2, 1));
    }
}
