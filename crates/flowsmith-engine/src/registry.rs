//! Automation registry.
//!
//! Owns the persisted automations. The stored record is the single source
//! of truth: nothing here caches automation state, so the scheduler, the
//! CLI and concurrent callers always see the same values.
//!
//! ```text
//!            create / start
//!  disabled ───────────────▶ enabled ──(next due ≤ now)──▶ due ──▶ running
//!     ▲                         │  ▲                                  │
//!     └────────── stop ─────────┘  └──────────── run finished ────────┘
//! ```
//!
//! Every mutation is a single targeted UPDATE, so a `stop` issued while a
//! run is in flight is never overwritten when the run records its result.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use flowsmith_adapters::Credentials;
use flowsmith_store::{AutomationStore, StoredAutomation};

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionReport, FlowExecutor, RunMode, RunOutcome};
use crate::flow::Flow;
use crate::validator::{ValidationPolicy, validate};

// ---------------------------------------------------------------------------
// Automation
// ---------------------------------------------------------------------------

/// A flow bound to a cadence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Automation {
    pub id: String,
    pub name: String,
    pub flow: Flow,
    /// Whole minutes between runs, at least one.
    pub cadence_minutes: i64,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    /// `None` until the first run completes.
    pub last_outcome: Option<RunOutcome>,
    pub next_due_at: DateTime<Utc>,
    pub run_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    pub fn cadence(&self) -> Duration {
        Duration::minutes(self.cadence_minutes)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_due_at <= now
    }

    /// `never_run` or the last outcome's name.
    pub fn last_outcome_label(&self) -> &'static str {
        self.last_outcome.map_or("never_run", RunOutcome::as_str)
    }

    /// Next due time after a run that was due at `self.next_due_at`.
    /// Missed cycles collapse into a single catch-up run.
    pub fn next_due_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = self.next_due_at + self.cadence();
        if next <= now { now + self.cadence() } else { next }
    }

    fn from_stored(stored: StoredAutomation) -> Result<Self> {
        Ok(Self {
            flow: Flow::from_value(stored.flow)?,
            last_run_at: stored.last_run_at.map(timestamp).transpose()?,
            last_outcome: RunOutcome::parse(&stored.last_outcome),
            next_due_at: timestamp(stored.next_due_at)?,
            created_at: timestamp(stored.created_at)?,
            updated_at: timestamp(stored.updated_at)?,
            id: stored.id,
            name: stored.name,
            cadence_minutes: stored.cadence_minutes,
            enabled: stored.enabled,
            run_count: stored.run_count,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| EngineError::Internal(format!("timestamp out of range: {secs}")))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct AutomationRegistry {
    store: AutomationStore,
    executor: Arc<FlowExecutor>,
    credentials: Credentials,
    policy: ValidationPolicy,
    clock: Arc<dyn Clock>,
}

impl AutomationRegistry {
    pub fn new(
        store: AutomationStore,
        executor: Arc<FlowExecutor>,
        credentials: Credentials,
        policy: ValidationPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            executor,
            credentials,
            policy,
            clock,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Persist `flow` as an enabled automation first due one cadence from
    /// now.
    pub async fn create(&self, flow: Flow, cadence_minutes: i64) -> Result<Automation> {
        if cadence_minutes < 1 {
            return Err(EngineError::InvalidInput(format!(
                "cadence must be at least one minute, got {cadence_minutes}"
            )));
        }

        let validation = validate(&flow, &self.policy);
        if !validation.is_runnable() {
            return Err(EngineError::ValidationRejected {
                flow: Box::new(flow),
                validation,
            });
        }

        for integration in flow.used_integrations() {
            let missing = self.credentials.missing(&integration);
            if !missing.is_empty() {
                return Err(EngineError::MissingCredentials {
                    integration,
                    keys: missing.into_iter().map(str::to_string).collect(),
                });
            }
        }

        let now = self.clock.now();
        let next_due = now + Duration::minutes(cadence_minutes);
        let stored = self
            .store
            .create(
                &flow.name,
                flow.to_value()?,
                cadence_minutes,
                next_due.timestamp(),
                now.timestamp(),
            )
            .await?;

        info!(
            automation_id = %stored.id,
            flow_id = %flow.id,
            cadence_minutes,
            score = validation.score,
            "automation created"
        );
        Automation::from_stored(stored)
    }

    pub async fn get(&self, id: &str) -> Result<Automation> {
        match self.store.get(id).await? {
            Some(stored) => Automation::from_stored(stored),
            None => Err(EngineError::NotFound {
                entity: "automation",
                id: id.to_string(),
            }),
        }
    }

    pub async fn list(&self) -> Result<Vec<Automation>> {
        self.store
            .list()
            .await?
            .into_iter()
            .map(Automation::from_stored)
            .collect()
    }

    /// Enabled automations due at `now`, most overdue first.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Automation>> {
        self.store
            .list_due(now.timestamp())
            .await?
            .into_iter()
            .map(Automation::from_stored)
            .collect()
    }

    /// Enable an automation. Its next due time is kept.
    pub async fn start(&self, id: &str) -> Result<Automation> {
        self.store
            .set_enabled(id, true, self.clock.now().timestamp())
            .await?;
        info!(automation_id = %id, "automation started");
        self.get(id).await
    }

    /// Disable an automation. Its next due time is kept; a run already in
    /// flight completes.
    pub async fn stop(&self, id: &str) -> Result<Automation> {
        self.store
            .set_enabled(id, false, self.clock.now().timestamp())
            .await?;
        info!(automation_id = %id, "automation stopped");
        self.get(id).await
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        info!(automation_id = %id, "automation removed");
        Ok(())
    }

    /// Run an automation immediately, whatever its state. Only the
    /// last-run fields change.
    pub async fn run_now(&self, id: &str) -> Result<ExecutionReport> {
        let automation = self.get(id).await?;
        self.execute_and_record(&automation).await
    }

    /// Move the stored next due time from `expected` to `next`. `false`
    /// when another writer got there first.
    pub async fn advance(
        &self,
        id: &str,
        expected: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self
            .store
            .advance_next_due(
                id,
                expected.timestamp(),
                next.timestamp(),
                self.clock.now().timestamp(),
            )
            .await?)
    }

    /// Execute the automation's flow and record the outcome.
    pub async fn execute_and_record(&self, automation: &Automation) -> Result<ExecutionReport> {
        let report = self.executor.execute(&automation.flow, RunMode::Real).await;
        self.store
            .record_run(
                &automation.id,
                report.finished_at.timestamp(),
                report.outcome.as_str(),
            )
            .await?;

        if report.outcome == RunOutcome::Success {
            info!(automation_id = %automation.id, outcome = %report.outcome, "automation run finished");
        } else {
            warn!(
                automation_id = %automation.id,
                outcome = %report.outcome,
                error = report.first_error().unwrap_or_default(),
                "automation run finished with failures"
            );
        }
        Ok(report)
    }

    /// Recompute the next due time of every enabled automation from its
    /// last run (or from now when it never ran). Disabled automations keep
    /// theirs. Returns how many records were updated.
    pub async fn reconcile(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut updated = 0;
        for automation in self.list().await?.into_iter().filter(|a| a.enabled) {
            let next = automation
                .last_run_at
                .map_or(now, |last| last + automation.cadence());
            if next != automation.next_due_at {
                self.store
                    .set_next_due(&automation.id, next.timestamp(), now.timestamp())
                    .await?;
                updated += 1;
            }
        }
        info!(updated, "automation schedule reconciled");
        Ok(updated)
    }

    /// `(total, enabled)` automation counts.
    pub async fn counts(&self) -> Result<(i64, i64)> {
        Ok(self.store.counts().await?)
    }
}
