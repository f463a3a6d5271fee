//! Service facade.
//!
//! [`FlowService`] is the single entry point front-ends use. It wires the
//! generation pipeline (interpret, build, validate, record) to the stores,
//! the executor and the automation registry.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use flowsmith_adapters::{CapabilityTable, Credentials, IntegrationStatus, catalog};
use flowsmith_store::{
    AutomationStore, Database, FlowStore, LearningRecord, LearningStats, LearningStore,
    NewSavedFlow, SavedFlow,
};

use crate::builder::build_flow;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::executor::{ExecutionReport, FlowExecutor, RunMode};
use crate::flow::Flow;
use crate::intent::IntentDescriptor;
use crate::interpreter::IntentInterpreter;
use crate::learning::LearningLog;
use crate::registry::{Automation, AutomationRegistry};
use crate::scheduler::Scheduler;
use crate::validator::{ValidationResult, Verdict, validate};

/// Output of [`FlowService::generate_flow`].
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    pub intent: IntentDescriptor,
    pub flow: Flow,
    pub validation: ValidationResult,
    /// Id of the learning record written for this attempt.
    pub learning_id: i64,
}

/// Counters for `flowsmith stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub learning: LearningStats,
    /// Accepted generations over all attempts, `None` before the first.
    pub success_rate: Option<f64>,
    pub saved_flows: i64,
    pub automations: i64,
    pub enabled_automations: i64,
}

pub struct FlowService {
    interpreter: IntentInterpreter,
    config: EngineConfig,
    learning: LearningLog,
    flows: FlowStore,
    registry: Arc<AutomationRegistry>,
    executor: Arc<FlowExecutor>,
    credentials: Credentials,
    clock: Arc<dyn Clock>,
}

impl FlowService {
    /// Wire a service over `db`. Interpretation is keyword-only until
    /// [`with_interpreter`](Self::with_interpreter) supplies a model.
    pub fn new(
        db: Database,
        table: CapabilityTable,
        credentials: Credentials,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let executor = Arc::new(FlowExecutor::new(
            table,
            config.executor.clone(),
            Arc::clone(&clock),
        ));
        let registry = Arc::new(AutomationRegistry::new(
            AutomationStore::new(db.clone()),
            Arc::clone(&executor),
            credentials.clone(),
            config.validation.clone(),
            Arc::clone(&clock),
        ));
        Self {
            interpreter: IntentInterpreter::keywords_only(),
            learning: LearningLog::new(LearningStore::new(db.clone()), Arc::clone(&clock)),
            flows: FlowStore::new(db),
            registry,
            executor,
            credentials,
            config,
            clock,
        }
    }

    pub fn with_interpreter(mut self, interpreter: IntentInterpreter) -> Self {
        self.interpreter = interpreter;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// A scheduler driving this service's automations.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::clone(&self.registry), &self.config.scheduler)
    }

    // -- generation ------------------------------------------------------------

    /// Interpret `prompt`, build and validate a flow, and record the attempt
    /// in the learning log. Rejected flows are recorded and returned as
    /// [`EngineError::ValidationRejected`].
    pub async fn generate_flow(&self, prompt: &str) -> Result<Generation> {
        let intent = match self.interpreter.interpret(prompt).await {
            Ok(intent) => intent,
            Err(e) => {
                self.learning
                    .record_failure(prompt, None, &e.to_string())
                    .await?;
                return Err(e);
            }
        };

        let flow = build_flow(&intent, prompt.trim(), self.clock.now());
        let validation = validate(&flow, &self.config.validation);
        let learning_id = self
            .learning
            .record_generation(prompt, &intent, &flow, &validation)
            .await?;

        info!(
            flow_id = %flow.id,
            nodes = flow.nodes.len(),
            score = validation.score,
            verdict = %validation.verdict,
            source = %intent.source,
            "flow generated"
        );

        if validation.verdict == Verdict::Rejected {
            return Err(EngineError::ValidationRejected {
                flow: Box::new(flow),
                validation,
            });
        }
        Ok(Generation {
            intent,
            flow,
            validation,
            learning_id,
        })
    }

    /// Run `flow` once. `real = false` simulates every external effect.
    pub async fn execute_flow(&self, flow: &Flow, real: bool) -> ExecutionReport {
        let mode = if real { RunMode::Real } else { RunMode::DryRun };
        self.executor.execute(flow, mode).await
    }

    // -- automations -----------------------------------------------------------

    pub async fn create_automation(&self, flow: Flow, cadence_minutes: i64) -> Result<Automation> {
        self.registry.create(flow, cadence_minutes).await
    }

    pub async fn start_automation(&self, id: &str) -> Result<Automation> {
        self.registry.start(id).await
    }

    pub async fn stop_automation(&self, id: &str) -> Result<Automation> {
        self.registry.stop(id).await
    }

    pub async fn run_automation_now(&self, id: &str) -> Result<ExecutionReport> {
        self.registry.run_now(id).await
    }

    pub async fn remove_automation(&self, id: &str) -> Result<()> {
        self.registry.remove(id).await
    }

    pub async fn list_automations(&self) -> Result<Vec<Automation>> {
        self.registry.list().await
    }

    pub async fn get_automation(&self, id: &str) -> Result<Automation> {
        self.registry.get(id).await
    }

    // -- saved flows -----------------------------------------------------------

    /// Persist `flow` for later use. The stored score is recomputed so it
    /// always matches the current policy.
    pub async fn save_flow(&self, flow: &Flow) -> Result<SavedFlow> {
        let validation = validate(flow, &self.config.validation);
        let new = NewSavedFlow {
            id: if flow.id.is_empty() {
                Uuid::now_v7().to_string()
            } else {
                flow.id.clone()
            },
            name: flow.name.clone(),
            description: Some(flow.description.clone()).filter(|d| !d.is_empty()),
            prompt: flow.source_prompt.clone(),
            flow: flow.to_value()?,
            intent: Some(serde_json::to_value(&flow.metadata)?),
            validation_score: Some(i64::from(validation.score)),
        };
        let saved = self.flows.save(new, self.clock.now().timestamp()).await?;
        info!(flow_id = %saved.id, score = validation.score, "flow saved");
        Ok(saved)
    }

    pub async fn list_saved_flows(&self, limit: usize, offset: usize) -> Result<Vec<SavedFlow>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(0);
        Ok(self.flows.list(limit, offset).await?)
    }

    pub async fn get_saved_flow(&self, id: &str) -> Result<SavedFlow> {
        self.flows
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound {
                entity: "saved flow",
                id: id.to_string(),
            })
    }

    pub async fn remove_saved_flow(&self, id: &str) -> Result<()> {
        self.flows.delete(id).await?;
        info!(flow_id = %id, "saved flow removed");
        Ok(())
    }

    /// Run a saved flow once. Real runs bump its execution counter.
    pub async fn execute_saved_flow(&self, id: &str, real: bool) -> Result<ExecutionReport> {
        let saved = self.get_saved_flow(id).await?;
        let flow = Flow::from_value(saved.flow)?;
        let report = self.execute_flow(&flow, real).await;
        if real {
            self.flows
                .record_execution(id, report.finished_at.timestamp())
                .await?;
        }
        Ok(report)
    }

    /// Turn a saved flow into an automation.
    pub async fn schedule_saved_flow(&self, id: &str, cadence_minutes: i64) -> Result<Automation> {
        let saved = self.get_saved_flow(id).await?;
        let flow = Flow::from_value(saved.flow)?;
        self.create_automation(flow, cadence_minutes).await
    }

    // -- reporting -------------------------------------------------------------

    pub async fn stats(&self) -> Result<EngineStats> {
        let learning = self.learning.stats().await?;
        let saved_flows = self.flows.count().await?;
        let (automations, enabled_automations) = self.registry.counts().await?;
        Ok(EngineStats {
            success_rate: learning.success_rate,
            learning,
            saved_flows,
            automations,
            enabled_automations,
        })
    }

    pub async fn history(&self, limit: usize) -> Result<Vec<LearningRecord>> {
        self.learning.history(limit).await
    }

    /// Every known integration and whether its credentials are present.
    pub fn list_integrations(&self) -> Vec<IntegrationStatus> {
        let statuses = catalog::statuses(&self.credentials);
        for status in statuses.iter().filter(|s| !s.configured) {
            warn!(
                integration = status.name,
                missing = ?status.missing_keys,
                "integration is not configured"
            );
        }
        statuses
    }
}
