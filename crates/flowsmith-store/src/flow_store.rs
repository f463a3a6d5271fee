//! Saved flow persistence.
//!
//! A saved flow is a generated flow snapshot the user chose to keep,
//! together with the prompt and intent that produced it and simple
//! execution bookkeeping. Snapshots are stored as JSON text.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A persisted flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedFlow {
    /// Flow identifier (the flow model's own id).
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Prompt the flow was generated from.
    pub prompt: String,
    /// JSON snapshot of the flow model.
    pub flow: serde_json::Value,
    /// JSON snapshot of the intent descriptor, when known.
    pub intent: Option<serde_json::Value>,
    /// Validation score at save time.
    pub validation_score: Option<i64>,
    /// How many times the flow has been executed from storage.
    pub execution_count: i64,
    pub last_executed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for [`FlowStore::save`].
#[derive(Debug, Clone)]
pub struct NewSavedFlow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub prompt: String,
    pub flow: serde_json::Value,
    pub intent: Option<serde_json::Value>,
    pub validation_score: Option<i64>,
}

// ═══════════════════════════════════════════════════════════════════════
//  FlowStore
// ═══════════════════════════════════════════════════════════════════════

const SELECT_COLUMNS: &str = "SELECT id, name, description, prompt, flow, intent, validation_score, \
     execution_count, last_executed_at, created_at, updated_at FROM saved_flows";

/// CRUD operations on saved flows.
#[derive(Clone)]
pub struct FlowStore {
    db: Database,
}

impl FlowStore {
    /// Create a new flow store backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a flow, or overwrite the snapshot of an already saved one.
    ///
    /// Re-saving keeps the execution bookkeeping and `created_at`.
    #[instrument(skip(self, new), fields(flow_id = %new.id))]
    pub async fn save(&self, new: NewSavedFlow, now: i64) -> StoreResult<SavedFlow> {
        let flow_json = serde_json::to_string(&new.flow)?;
        let intent_json = new.intent.as_ref().map(serde_json::to_string).transpose()?;
        let id = new.id.clone();

        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO saved_flows (id, name, description, prompt, flow, intent, validation_score, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8) \
                     ON CONFLICT(id) DO UPDATE SET name = excluded.name, description = excluded.description, \
                     prompt = excluded.prompt, flow = excluded.flow, intent = excluded.intent, \
                     validation_score = excluded.validation_score, updated_at = excluded.updated_at",
                    rusqlite::params![
                        new.id,
                        new.name,
                        new.description,
                        new.prompt,
                        flow_json,
                        intent_json,
                        new.validation_score,
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;

        debug!("flow saved");
        self.get(&id).await?.ok_or(StoreError::NotFound {
            entity: "saved flow",
            id,
        })
    }

    /// Fetch a saved flow by id.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> StoreResult<Option<SavedFlow>> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let result = conn.query_row(
                    &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                    rusqlite::params![id],
                    SavedFlowRow::from_row,
                );
                match result {
                    Ok(row) => row.into_saved_flow().map(Some),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(StoreError::Sqlite(e)),
                }
            })
            .await
    }

    /// List saved flows, most recently updated first.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: i64, offset: i64) -> StoreResult<Vec<SavedFlow>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2"
                ))?;
                let rows = stmt
                    .query_map(rusqlite::params![limit, offset], SavedFlowRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(SavedFlowRow::into_saved_flow).collect()
            })
            .await
    }

    /// Bump the execution counter and stamp the execution time.
    #[instrument(skip(self))]
    pub async fn record_execution(&self, id: &str, executed_at: i64) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let updated = conn.execute(
                    "UPDATE saved_flows SET execution_count = execution_count + 1, \
                     last_executed_at = ?2, updated_at = ?2 WHERE id = ?1",
                    rusqlite::params![id, executed_at],
                )?;
                if updated == 0 {
                    return Err(StoreError::NotFound {
                        entity: "saved flow",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Delete a saved flow.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM saved_flows WHERE id = ?1", rusqlite::params![id])?;
                if deleted == 0 {
                    return Err(StoreError::NotFound {
                        entity: "saved flow",
                        id,
                    });
                }
                Ok(())
            })
            .await
    }

    /// Total number of saved flows.
    pub async fn count(&self) -> StoreResult<i64> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM saved_flows", [], |row| row.get(0))?)
            })
            .await
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Internal row mapping
// ═══════════════════════════════════════════════════════════════════════

/// Raw row; JSON decoding happens in [`SavedFlowRow::into_saved_flow`].
struct SavedFlowRow {
    id: String,
    name: String,
    description: Option<String>,
    prompt: String,
    flow: String,
    intent: Option<String>,
    validation_score: Option<i64>,
    execution_count: i64,
    last_executed_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl SavedFlowRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            prompt: row.get(3)?,
            flow: row.get(4)?,
            intent: row.get(5)?,
            validation_score: row.get(6)?,
            execution_count: row.get(7)?,
            last_executed_at: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_saved_flow(self) -> StoreResult<SavedFlow> {
        Ok(SavedFlow {
            id: self.id,
            name: self.name,
            description: self.description,
            prompt: self.prompt,
            flow: serde_json::from_str(&self.flow)?,
            intent: self.intent.map(|i| serde_json::from_str(&i)).transpose()?,
            validation_score: self.validation_score,
            execution_count: self.execution_count,
            last_executed_at: self.last_executed_at,
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

    async fn setup() -> FlowStore {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        FlowStore::new(db)
    }

    fn sample(id: &str) -> NewSavedFlow {
        NewSavedFlow {
            id: id.to_string(),
            name: "dollar quote".to_string(),
            description: Some("fetch the dollar quote".to_string()),
            prompt: "send me the dollar quote".to_string(),
            flow: json!({"nodes": [], "edges": []}),
            intent: Some(json!({"action": "fetch"})),
            validation_score: Some(100),
        }
    }

    #[tokio::test]
    async fn save_and_get_roundtrip() {
        let store = setup().await;
        let saved = store.save(sample("f1"), 1_000).await.unwrap();

        assert_eq!(saved.id, "f1");
        assert_eq!(saved.execution_count, 0);
        assert_eq!(saved.last_executed_at, None);
        assert_eq!(saved.created_at, 1_000);

        let fetched = store.get("f1").await.unwrap().unwrap();
        assert_eq!(fetched, saved);
    }

    #[tokio::test]
    async fn resave_keeps_counters_and_creation_time() {
        let store = setup().await;
        store.save(sample("f1"), 1_000).await.unwrap();
        store.record_execution("f1", 1_500).await.unwrap();

        let mut update = sample("f1");
        update.name = "renamed".to_string();
        let saved = store.save(update, 2_000).await.unwrap();

        assert_eq!(saved.name, "renamed");
        assert_eq!(saved.execution_count, 1);
        assert_eq!(saved.created_at, 1_000);
        assert_eq!(saved.updated_at, 2_000);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_execution_on_missing_flow_is_not_found() {
        let store = setup().await;
        let err = store.record_execution("nope", 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_delete_removes() {
        let store = setup().await;
        store.save(sample("a"), 10).await.unwrap();
        store.save(sample("b"), 20).await.unwrap();

        let listed = store.list(10, 0).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);

        store.delete("a").await.unwrap();
        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.delete("a").await.unwrap_err().is_not_found());
    }
}
