//! Append-only learning log.
//!
//! One record per generation attempt, successful or not. The store offers
//! no update or delete, and the schema aborts any attempt to do either.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::StoreResult;

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// A record to append.
#[derive(Debug, Clone, Default)]
pub struct NewLearningRecord {
    pub recorded_at: i64,
    pub prompt: String,
    pub intent: Option<serde_json::Value>,
    pub flow_id: Option<String>,
    pub flow: Option<serde_json::Value>,
    pub validation: Option<serde_json::Value>,
    pub score: Option<i64>,
    /// `accepted`, `accepted_with_warnings` or `rejected`.
    pub verdict: Option<String>,
    /// Pipeline error text when generation failed.
    pub error: Option<String>,
}

/// A stored learning record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningRecord {
    pub id: i64,
    pub recorded_at: i64,
    pub prompt: String,
    pub intent: Option<serde_json::Value>,
    pub flow_id: Option<String>,
    pub flow: Option<serde_json::Value>,
    pub validation: Option<serde_json::Value>,
    pub score: Option<i64>,
    pub verdict: Option<String>,
    pub error: Option<String>,
}

/// Aggregates over the whole log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    pub total: i64,
    pub accepted: i64,
    pub accepted_with_warnings: i64,
    pub rejected: i64,
    /// Attempts that ended in a pipeline error (no verdict).
    pub errored: i64,
    /// Mean score over records that were scored.
    pub average_score: Option<f64>,
    /// Share of attempts that ended accepted, with or without warnings.
    /// `None` for an empty log.
    pub success_rate: Option<f64>,
}

// ═══════════════════════════════════════════════════════════════════════
//  LearningStore
// ═══════════════════════════════════════════════════════════════════════

/// Append and read access to the learning log.
#[derive(Clone)]
pub struct LearningStore {
    db: Database,
}

impl LearningStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a record and return its id.
    #[instrument(skip(self, record))]
    pub async fn append(&self, record: NewLearningRecord) -> StoreResult<i64> {
        let intent = record.intent.as_ref().map(serde_json::to_string).transpose()?;
        let flow = record.flow.as_ref().map(serde_json::to_string).transpose()?;
        let validation = record
            .validation
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let id = self
            .db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO learning_records (recorded_at, prompt, intent, flow_id, flow, validation, score, verdict, error) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        record.recorded_at,
                        record.prompt,
                        intent,
                        record.flow_id,
                        flow,
                        validation,
                        record.score,
                        record.verdict,
                        record.error
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;

        debug!(record_id = id, "learning record appended");
        Ok(id)
    }

    /// The most recent `limit` records, newest first.
    #[instrument(skip(self))]
    pub async fn recent(&self, limit: i64) -> StoreResult<Vec<LearningRecord>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, recorded_at, prompt, intent, flow_id, flow, validation, score, verdict, error \
                     FROM learning_records ORDER BY recorded_at DESC, id DESC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![limit], |row| {
                        Ok(LearningRow {
                            id: row.get(0)?,
                            recorded_at: row.get(1)?,
                            prompt: row.get(2)?,
                            intent: row.get(3)?,
                            flow_id: row.get(4)?,
                            flow: row.get(5)?,
                            validation: row.get(6)?,
                            score: row.get(7)?,
                            verdict: row.get(8)?,
                            error: row.get(9)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(LearningRow::into_record).collect()
            })
            .await
    }

    /// Aggregate counts and the average score.
    #[instrument(skip(self))]
    pub async fn stats(&self) -> StoreResult<LearningStats> {
        self.db
            .execute(|conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*), \
                        COALESCE(SUM(verdict = 'accepted'), 0), \
                        COALESCE(SUM(verdict = 'accepted_with_warnings'), 0), \
                        COALESCE(SUM(verdict = 'rejected'), 0), \
                        COALESCE(SUM(error IS NOT NULL), 0), \
                        AVG(score) \
                     FROM learning_records",
                    [],
                    |row| {
                        let total: i64 = row.get(0)?;
                        let accepted: i64 = row.get(1)?;
                        let accepted_with_warnings: i64 = row.get(2)?;
                        let success_rate = (total > 0)
                            .then(|| (accepted + accepted_with_warnings) as f64 / total as f64);
                        Ok(LearningStats {
                            total,
                            accepted,
                            accepted_with_warnings,
                            rejected: row.get(3)?,
                            errored: row.get(4)?,
                            average_score: row.get(5)?,
                            success_rate,
                        })
                    },
                )?)
            })
            .await
    }
}

struct LearningRow {
    id: i64,
    recorded_at: i64,
    prompt: String,
    intent: Option<String>,
    flow_id: Option<String>,
    flow: Option<String>,
    validation: Option<String>,
    score: Option<i64>,
    verdict: Option<String>,
    error: Option<String>,
}

impl LearningRow {
    fn into_record(self) -> StoreResult<LearningRecord> {
        let decode = |text: Option<String>| -> StoreResult<Option<serde_json::Value>> {
            Ok(text.map(|t| serde_json::from_str(&t)).transpose()?)
        };
        Ok(LearningRecord {
            id: self.id,
            recorded_at: self.recorded_at,
            prompt: self.prompt,
            intent: decode(self.intent)?,
            flow_id: self.flow_id,
            flow: decode(self.flow)?,
            validation: decode(self.validation)?,
            score: self.score,
            verdict: self.verdict,
            error: self.error,
        })
    }
}
