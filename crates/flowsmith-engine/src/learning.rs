//! Learning log: one append-only record per generation attempt, successful
//! or not.

use std::sync::Arc;

use tracing::debug;

use flowsmith_store::{LearningRecord, LearningStats, LearningStore, NewLearningRecord};

use crate::clock::Clock;
use crate::error::Result;
use crate::flow::Flow;
use crate::intent::IntentDescriptor;
use crate::validator::ValidationResult;

#[derive(Clone)]
pub struct LearningLog {
    store: LearningStore,
    clock: Arc<dyn Clock>,
}

impl LearningLog {
    pub fn new(store: LearningStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a completed generation.
    pub async fn record_generation(
        &self,
        prompt: &str,
        intent: &IntentDescriptor,
        flow: &Flow,
        validation: &ValidationResult,
    ) -> Result<i64> {
        let record = NewLearningRecord {
            recorded_at: self.clock.now().timestamp(),
            prompt: prompt.to_string(),
            intent: Some(serde_json::to_value(intent)?),
            flow_id: Some(flow.id.clone()),
            flow: Some(flow.to_value()?),
            validation: Some(serde_json::to_value(validation)?),
            score: Some(i64::from(validation.score)),
            verdict: Some(validation.verdict.as_str().to_string()),
            error: None,
        };
        let id = self.store.append(record).await?;
        debug!(record_id = id, flow_id = %flow.id, score = validation.score, "generation recorded");
        Ok(id)
    }

    /// Record a generation that stopped with an error. `intent` is whatever
    /// the pipeline had produced before failing.
    pub async fn record_failure(
        &self,
        prompt: &str,
        intent: Option<&IntentDescriptor>,
        error: &str,
    ) -> Result<i64> {
        let record = NewLearningRecord {
            recorded_at: self.clock.now().timestamp(),
            prompt: prompt.to_string(),
            intent: intent.map(serde_json::to_value).transpose()?,
            flow_id: None,
            flow: None,
            validation: None,
            score: None,
            verdict: None,
            error: Some(error.to_string()),
        };
        let id = self.store.append(record).await?;
        debug!(record_id = id, %error, "generation failure recorded");
        Ok(id)
    }

    /// The newest `limit` records, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<LearningRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(self.store.recent(limit).await?)
    }

    pub async fn stats(&self) -> Result<LearningStats> {
        Ok(self.store.stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_flow;
    use crate::clock::ManualClock;
    use crate::interpreter::KeywordClassifier;
    use crate::validator::{ValidationPolicy, validate};
    use flowsmith_store::Database;

    async fn log() -> (LearningLog, Arc<ManualClock>) {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        let clock = Arc::new(ManualClock::at_unix(1_760_000_000));
        (LearningLog::new(LearningStore::new(db), clock.clone()), clock)
    }

    #[tokio::test]
    async fn records_generations_and_failures() {
        let (log, clock) = log().await;
        let prompt = "send me the dollar quote";
        let intent = KeywordClassifier::new().classify(prompt);
        let flow = build_flow(&intent, prompt, clock.now());
        let validation = validate(&flow, &ValidationPolicy::default());

        log.record_generation(prompt, &intent, &flow, &validation)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(5));
        log.record_failure("", None, "invalid input: prompt is empty")
            .await
            .unwrap();

        let history = log.history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].error.as_deref(), Some("invalid input: prompt is empty"));
        assert!(history[0].flow_id.is_none());
        assert_eq!(history[1].flow_id.as_deref(), Some(flow.id.as_str()));
        assert_eq!(history[1].verdict.as_deref(), Some("accepted"));
        assert_eq!(history[1].intent.as_ref().unwrap()["action"], "fetch");

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.errored, 1);
        assert_eq!(stats.average_score, Some(100.0));
        assert_eq!(stats.success_rate, Some(0.5));
    }

    #[tokio::test]
    async fn history_respects_limit() {
        let (log, clock) = log().await;
        for i in 0..5 {
            clock.advance(chrono::Duration::seconds(1));
            log.record_failure(&format!("prompt {i}"), None, "boom")
                .await
                .unwrap();
        }
        let history = log.history(3).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].prompt, "prompt 4");
    }
}
