//! Flow executor.
//!
//! Walks a flow in topological order from its trigger (loop-back edges are
//! ignored for ordering), runs each node against a shared JSON context and
//! records one [`NodeReport`] per node. Execution never returns an error:
//! anything that goes wrong ends up in the [`ExecutionReport`].
//!
//! A node runs when at least one of its incoming edges is *active*. An edge
//! is active when its source succeeded and, for a `condition` source, the
//! edge carries the branch that was taken (unlabelled edges count as
//! `true`); for a `loop` source only the `exit` edge is active outside the
//! loop body. Everything else is skipped, which is how a failure or an
//! untaken branch prunes the nodes below it.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use flowsmith_adapters::{
    ActionOutput, ActionRequest, AdapterError, Capability, CapabilityTable, catalog,
};

use crate::clock::Clock;
use crate::config::ExecutorConfig;
use crate::flow::{Flow, FlowEdge, FlowNode, NodeKind, branch};

type Context = Map<String, Value>;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

/// Whether integrations are really called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Real,
    /// Simulate every external effect: no integration calls, no files.
    DryRun,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "real"),
            Self::DryRun => write!(f, "dry_run"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Succeeded,
    Skipped,
    Failed,
}

/// Overall result of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    PartialFailure,
    Failure,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialFailure => "partial_failure",
            Self::Failure => "failure",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial_failure" => Some(Self::PartialFailure),
            "failure" => Some(Self::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub output: Value,
    pub error: Option<String>,
    /// File written by the node, if any.
    pub artifact: Option<PathBuf>,
    /// Completed iterations, for loop nodes.
    pub iterations: Option<u32>,
    /// Integration attempts made (0 when the node calls nothing).
    pub attempts: u32,
}

/// Result of executing a flow once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub flow_id: String,
    pub flow_name: String,
    pub mode: RunMode,
    pub outcome: RunOutcome,
    /// Node reports in execution order; nodes that never ran come last.
    pub nodes: Vec<NodeReport>,
    /// Set when the flow could not be traversed at all.
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionReport {
    pub fn node(&self, id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }

    /// Files written during the run.
    pub fn artifacts(&self) -> impl Iterator<Item = &Path> {
        self.nodes.iter().filter_map(|n| n.artifact.as_deref())
    }

    /// The text produced by the first output node that ran.
    pub fn output_text(&self) -> Option<&str> {
        self.nodes
            .iter()
            .find(|n| n.kind == NodeKind::Output && n.status == NodeStatus::Succeeded)
            .and_then(|n| n.output.get("text"))
            .and_then(Value::as_str)
    }

    /// First node error, or the flow-level error.
    pub fn first_error(&self) -> Option<&str> {
        self.error.as_deref().or_else(|| {
            self.nodes
                .iter()
                .find(|n| n.status == NodeStatus::Failed)
                .and_then(|n| n.error.as_deref())
        })
    }
}

// ---------------------------------------------------------------------------
// Node step result
// ---------------------------------------------------------------------------

struct Step {
    status: NodeStatus,
    output: Value,
    error: Option<String>,
    artifact: Option<PathBuf>,
    iterations: Option<u32>,
    attempts: u32,
}

impl Step {
    fn ok(output: Value) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            output,
            error: None,
            artifact: None,
            iterations: None,
            attempts: 0,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failed,
            output: Value::Null,
            error: Some(error.into()),
            artifact: None,
            iterations: None,
            attempts: 0,
        }
    }

    fn skipped() -> Self {
        Self {
            status: NodeStatus::Skipped,
            ..Self::ok(Value::Null)
        }
    }

    fn with_artifact(mut self, path: PathBuf) -> Self {
        self.artifact = Some(path);
        self
    }

    fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    fn into_report(self, node: &FlowNode) -> NodeReport {
        NodeReport {
            node_id: node.id.clone(),
            kind: node.kind,
            status: self.status,
            output: self.output,
            error: self.error,
            artifact: self.artifact,
            iterations: self.iterations,
            attempts: self.attempts,
        }
    }
}

/// Mutable state of one run.
#[derive(Default)]
struct RunState {
    ctx: Context,
    status: HashMap<String, NodeStatus>,
    /// Branch taken by each condition node that ran.
    taken: HashMap<String, &'static str>,
    reports: Vec<NodeReport>,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs flows against a capability table.
pub struct FlowExecutor {
    table: CapabilityTable,
    config: ExecutorConfig,
    clock: Arc<dyn Clock>,
}

impl FlowExecutor {
    pub fn new(table: CapabilityTable, config: ExecutorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            table,
            config,
            clock,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Execute `flow` once.
    pub async fn execute(&self, flow: &Flow, mode: RunMode) -> ExecutionReport {
        let started_at = self.clock.now();
        info!(flow_id = %flow.id, name = %flow.name, %mode, "starting flow execution");

        let plan = match Plan::new(flow) {
            Ok(plan) => plan,
            Err(reason) => {
                warn!(flow_id = %flow.id, %reason, "flow is not traversable");
                return ExecutionReport {
                    flow_id: flow.id.clone(),
                    flow_name: flow.name.clone(),
                    mode,
                    outcome: RunOutcome::Failure,
                    nodes: Vec::new(),
                    error: Some(reason),
                    started_at,
                    finished_at: self.clock.now(),
                };
            }
        };

        let mut state = RunState::default();
        for id in &plan.main {
            let Some(node) = flow.node(id) else { continue };
            let step = if node.kind == NodeKind::Trigger || is_active(flow, &node.id, &state, None) {
                if node.kind == NodeKind::Loop {
                    self.run_loop(flow, node, &plan, &mut state, mode).await
                } else {
                    self.run_node(flow, node, &mut state.ctx, mode).await
                }
            } else {
                Step::skipped()
            };
            record(&mut state, node, step);
        }

        // Nodes that were never visited, e.g. the body of a skipped loop.
        let seen: HashSet<String> = state.reports.iter().map(|r| r.node_id.clone()).collect();
        for node in flow.nodes.iter().filter(|n| !seen.contains(&n.id)) {
            state.reports.push(Step::skipped().into_report(node));
        }

        let outcome = outcome_of(&state.reports);
        let report = ExecutionReport {
            flow_id: flow.id.clone(),
            flow_name: flow.name.clone(),
            mode,
            outcome,
            nodes: state.reports,
            error: None,
            started_at,
            finished_at: self.clock.now(),
        };

        info!(
            flow_id = %flow.id,
            %outcome,
            succeeded = report.count(NodeStatus::Succeeded),
            failed = report.count(NodeStatus::Failed),
            skipped = report.count(NodeStatus::Skipped),
            "flow execution finished"
        );
        report
    }

    // -- loops -----------------------------------------------------------------

    async fn run_loop(
        &self,
        flow: &Flow,
        node: &FlowNode,
        plan: &Plan,
        state: &mut RunState,
        mode: RunMode,
    ) -> Step {
        let cap = self.config.max_loop_iterations.max(1);
        let requested = node
            .params
            .get("max_iterations")
            .and_then(Value::as_u64)
            .filter(|&n| n >= 1);
        // A limit that comes from the cap rather than the node is never a
        // legitimate exit.
        let (limit, capped_by_config) = match requested {
            Some(n) if n <= u64::from(cap) => (n as u32, false),
            _ => (cap, true),
        };

        let items: Option<Vec<Value>> = node.param_str("over").map(|path| {
            match lookup(&state.ctx, path) {
                Some(Value::Array(items)) => items.clone(),
                Some(Value::Null) | None => Vec::new(),
                Some(single) => vec![single.clone()],
            }
        });
        let until = node.params.get("until").cloned();
        let body = plan.bodies.get(&node.id).map(Vec::as_slice).unwrap_or_default();

        let mut iterations = 0u32;
        let mut exit_met = false;
        let mut body_reports: HashMap<String, NodeReport> = HashMap::new();
        let mut body_failure = None;

        loop {
            if let Some(items) = &items
                && iterations as usize >= items.len()
            {
                exit_met = true;
                break;
            }
            if iterations >= limit {
                break;
            }

            if let Some(items) = &items {
                state.ctx.insert("item".into(), items[iterations as usize].clone());
            }
            state.ctx.insert("index".into(), json!(iterations));
            state.status.insert(node.id.clone(), NodeStatus::Succeeded);

            for id in body {
                let Some(body_node) = flow.node(id) else { continue };
                let step = if is_active(flow, id, state, Some(&node.id)) {
                    self.run_node(flow, body_node, &mut state.ctx, mode).await
                } else {
                    Step::skipped()
                };
                state.status.insert(id.clone(), step.status);
                if step.status == NodeStatus::Failed && body_failure.is_none() {
                    body_failure = Some(id.clone());
                }
                body_reports.insert(id.clone(), step.into_report(body_node));
            }
            iterations += 1;
            debug!(loop_id = %node.id, iterations, "loop iteration finished");

            if body_failure.is_some() {
                break;
            }
            if let Some(until) = &until
                && condition_holds(&state.ctx, until).unwrap_or(false)
            {
                exit_met = true;
                break;
            }
        }

        state.ctx.remove("item");
        state.ctx.remove("index");
        for id in body {
            if let Some(report) = body_reports.remove(id) {
                state.reports.push(report);
            }
        }

        let output = json!({ "iterations": iterations, "limit": limit });
        let mut step = if let Some(failed) = body_failure {
            Step::failed(format!("loop body node `{failed}` failed at iteration {iterations}"))
        } else if !exit_met && (capped_by_config || items.is_some() || until.is_some()) {
            warn!(loop_id = %node.id, limit, "loop hit its iteration cap");
            Step {
                output,
                ..Step::failed(format!("loop stopped at the iteration cap of {limit}"))
            }
        } else {
            Step::ok(output)
        };
        step.iterations = Some(iterations);
        step
    }

    // -- single nodes ----------------------------------------------------------

    async fn run_node(&self, flow: &Flow, node: &FlowNode, ctx: &mut Context, mode: RunMode) -> Step {
        debug!(node_id = %node.id, kind = %node.kind, "running node");
        let step = match node.kind {
            NodeKind::Trigger => {
                let output = json!({
                    "fired_at": self.clock.now().to_rfc3339(),
                    "mode": node.param_str("mode").unwrap_or("manual"),
                });
                ctx.insert("trigger".into(), output.clone());
                Step::ok(output)
            }
            NodeKind::Search => self.run_search(node, ctx, mode).await,
            NodeKind::Transform => self.run_transform(flow, node, ctx),
            NodeKind::Condition => run_condition(node, ctx),
            // Loops only run through `run_loop`; a loop met here is nested.
            NodeKind::Loop => Step::failed("nested loops are not supported"),
            NodeKind::Integration => self.run_integration(flow, node, ctx, mode).await,
            NodeKind::Database => self.run_database(flow, node, ctx, mode).await,
            NodeKind::Output => self.run_output(flow, node, ctx, mode).await,
        };

        if step.status == NodeStatus::Succeeded {
            ctx.insert(node.id.clone(), step.output.clone());
        } else if let Some(error) = &step.error {
            warn!(node_id = %node.id, kind = %node.kind, %error, "node failed");
        }
        step
    }

    async fn run_search(&self, node: &FlowNode, ctx: &mut Context, mode: RunMode) -> Step {
        let source = node.param_str("source").unwrap_or("web");
        if source != "quote" {
            let output = json!({
                "source": source,
                "query": node.param_str("query").unwrap_or_default(),
                "results": [],
            });
            ctx.insert("search".into(), output.clone());
            ctx.insert("payload".into(), output.clone());
            return Step::ok(output);
        }

        let integration = node.integration().unwrap_or("quote");
        let symbols: Vec<String> = match node.params.get("symbols") {
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            _ => node.param_str("symbol").map(str::to_string).into_iter().collect(),
        };
        if symbols.is_empty() {
            return Step::failed("quote search has no symbols");
        }

        let mut quotes = Vec::new();
        let mut errors = Vec::new();
        let mut attempts = 0;
        for symbol in symbols {
            if mode == RunMode::DryRun {
                quotes.push(json!({
                    "symbol": symbol,
                    "name": symbol,
                    "value": 0.0,
                    "change_pct": 0.0,
                    "simulated": true,
                }));
                continue;
            }
            let (result, tries) = self
                .invoke(integration, ActionRequest::QuoteFetch { symbol: symbol.clone() })
                .await;
            attempts += tries;
            match result {
                Ok(ActionOutput::Quote(quote)) => quotes.push(serde_json::to_value(&quote).unwrap_or(Value::Null)),
                Ok(other) => errors.push(format!("{symbol}: unexpected output {}", other.to_json())),
                Err(e) => errors.push(format!("{symbol}: {e}")),
            }
        }

        if quotes.is_empty() {
            return Step::failed(errors.join("; ")).with_attempts(attempts);
        }
        let quotes = Value::Array(quotes);
        ctx.insert("quotes".into(), quotes.clone());
        ctx.insert("payload".into(), quotes.clone());
        Step::ok(json!({ "quotes": quotes, "errors": errors })).with_attempts(attempts)
    }

    fn run_transform(&self, flow: &Flow, node: &FlowNode, ctx: &mut Context) -> Step {
        match node.param_str("operation").unwrap_or("passthrough") {
            "format" => {
                let message = format_message(&flow.name, ctx, self.clock.now());
                ctx.insert("message".into(), Value::String(message.clone()));
                Step::ok(json!({ "message": message }))
            }
            "collect" => {
                let item = ctx.get("item").cloned().unwrap_or(Value::Null);
                let collected = ctx
                    .entry("collected")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(items) = collected {
                    items.push(item);
                    let len = items.len();
                    Step::ok(json!({ "collected": len }))
                } else {
                    Step::failed("context key `collected` is not a list")
                }
            }
            _ => Step::ok(ctx.get("payload").cloned().unwrap_or(Value::Null)),
        }
    }

    async fn run_integration(&self, flow: &Flow, node: &FlowNode, ctx: &Context, mode: RunMode) -> Step {
        let Some(name) = node.integration() else {
            return Step::failed("integration node has no `integration` parameter");
        };
        let Some(spec) = catalog::spec(name) else {
            return Step::failed(format!("unknown integration `{name}`"));
        };

        let text = message_text(ctx);
        let request = match spec.capability {
            Capability::MessagingBotSend => ActionRequest::BotMessage {
                target: node.param_str("target").map(str::to_string),
                text,
            },
            Capability::EmailSend => ActionRequest::Email {
                to: node.param_str("to").map(str::to_string),
                subject: node.param_str("subject").unwrap_or(flow.name.as_str()).to_string(),
                body: text,
            },
            Capability::ChannelNotify => ActionRequest::ChannelNotify {
                channel: node.param_str("channel").map(str::to_string),
                text,
            },
            Capability::QuoteFetch => ActionRequest::QuoteFetch {
                symbol: node.param_str("symbol").unwrap_or("USD-BRL").to_string(),
            },
        };

        if mode == RunMode::DryRun {
            return Step::ok(json!({
                "simulated": true,
                "integration": name,
                "request": serde_json::to_value(&request).unwrap_or(Value::Null),
            }));
        }

        let (result, attempts) = self.invoke(name, request).await;
        let step = match result {
            Ok(output) => Step::ok(output.to_json()),
            Err(e) => Step::failed(e.to_string()),
        };
        step.with_attempts(attempts)
    }

    async fn run_database(&self, flow: &Flow, node: &FlowNode, ctx: &Context, mode: RunMode) -> Step {
        let table = sanitize(node.param_str("table").unwrap_or("records"), "records");
        let path = self.config.output_dir.join(format!("{table}.jsonl"));
        let payload = ctx.get("payload").cloned().unwrap_or(Value::Null);

        if mode == RunMode::DryRun {
            return Step::ok(json!({ "simulated": true, "table": table }));
        }

        let line = json!({
            "flow_id": flow.id,
            "node_id": node.id,
            "recorded_at": self.clock.now().to_rfc3339(),
            "payload": payload,
        });
        match append_line(&path, &line).await {
            Ok(()) => Step::ok(json!({ "table": table, "path": path.display().to_string() }))
                .with_artifact(path),
            Err(e) => Step::failed(format!("failed to write {}: {e}", path.display())),
        }
    }

    async fn run_output(&self, flow: &Flow, node: &FlowNode, ctx: &Context, mode: RunMode) -> Step {
        let kind = node.param_str("kind").unwrap_or("file");
        let text = message_text(ctx);
        if kind != "file" {
            return Step::ok(json!({ "kind": kind, "text": text }));
        }

        let file_name = format!(
            "{}-{}.txt",
            sanitize(&flow.name, "flow"),
            self.clock.now().format("%Y%m%d-%H%M%S")
        );
        let path = self.config.output_dir.join(file_name);
        if mode == RunMode::DryRun {
            return Step::ok(json!({
                "kind": kind,
                "text": text,
                "simulated": true,
                "path": path.display().to_string(),
            }));
        }

        let written = async {
            tokio::fs::create_dir_all(&self.config.output_dir).await?;
            tokio::fs::write(&path, text.as_bytes()).await
        }
        .await;
        match written {
            Ok(()) => Step::ok(json!({ "kind": kind, "text": text, "path": path.display().to_string() }))
                .with_artifact(path),
            Err(e) => Step::failed(format!("failed to write {}: {e}", path.display())),
        }
    }

    /// Call an integration under the configured timeout, retrying
    /// retryable failures. Returns the result and the attempts made.
    async fn invoke(
        &self,
        integration: &str,
        request: ActionRequest,
    ) -> (Result<ActionOutput, AdapterError>, u32) {
        let max_attempts = self.config.integration_retries + 1;
        let timeout = self.config.integration_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(integration, attempt, max_attempts, "integration call attempt");

            let err = match tokio::time::timeout(timeout, self.table.invoke(integration, request.clone())).await {
                Ok(Ok(output)) => return (Ok(output), attempt),
                Ok(Err(e)) => e,
                Err(_elapsed) => AdapterError::Timeout {
                    seconds: timeout.as_secs(),
                    reason: format!("`{integration}` did not answer"),
                },
            };

            if !err.is_retryable() || attempt >= max_attempts {
                return (Err(err), attempt);
            }
            warn!(integration, attempt, error = %err, "integration call failed, retrying");
        }
    }
}

// ---------------------------------------------------------------------------
// Traversal plan
// ---------------------------------------------------------------------------

/// Execution order, with loop bodies split out of the main sequence.
struct Plan {
    main: Vec<String>,
    /// Loop id -> body node ids in topological order.
    bodies: HashMap<String, Vec<String>>,
}

impl Plan {
    fn new(flow: &Flow) -> Result<Self, String> {
        let errors = flow.structural_errors();
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }
        let order = flow
            .topological_order()
            .ok_or_else(|| "flow contains a cycle outside a loop-back edge".to_string())?;

        let mut bodies = HashMap::new();
        let mut in_body = HashSet::new();
        for node in flow.nodes_of(NodeKind::Loop) {
            let members = flow.loop_body(&node.id);
            if members
                .iter()
                .any(|id| flow.node(id).is_some_and(|n| n.kind == NodeKind::Loop))
            {
                return Err(format!("loop `{}` contains a nested loop", node.id));
            }
            let body: Vec<String> = order.iter().filter(|id| members.contains(*id)).cloned().collect();
            in_body.extend(members);
            bodies.insert(node.id.clone(), body);
        }

        let main = order.into_iter().filter(|id| !in_body.contains(id)).collect();
        Ok(Self { main, bodies })
    }
}

fn is_active(flow: &Flow, id: &str, state: &RunState, inside_loop: Option<&str>) -> bool {
    flow.incoming(id)
        .filter(|e| !e.is_loop_back)
        .any(|e| edge_active(flow, e, state, inside_loop))
}

fn edge_active(flow: &Flow, edge: &FlowEdge, state: &RunState, inside_loop: Option<&str>) -> bool {
    if state.status.get(&edge.from) != Some(&NodeStatus::Succeeded) {
        return false;
    }
    let label = edge.branch.as_deref();
    match flow.node(&edge.from).map(|n| n.kind) {
        Some(NodeKind::Condition) => {
            let taken = state.taken.get(&edge.from).copied();
            taken == Some(label.unwrap_or(branch::TRUE))
        }
        Some(NodeKind::Loop) if inside_loop == Some(edge.from.as_str()) => label == Some(branch::BODY),
        Some(NodeKind::Loop) => label != Some(branch::BODY),
        _ => true,
    }
}

fn record(state: &mut RunState, node: &FlowNode, step: Step) {
    state.status.insert(node.id.clone(), step.status);
    if node.kind == NodeKind::Condition
        && step.status == NodeStatus::Succeeded
        && let Some(taken) = step.output.get("branch").and_then(Value::as_str)
    {
        let taken = if taken == branch::TRUE { branch::TRUE } else { branch::FALSE };
        state.taken.insert(node.id.clone(), taken);
    }
    state.reports.push(step.into_report(node));
}

fn outcome_of(reports: &[NodeReport]) -> RunOutcome {
    let failed = reports.iter().any(|r| r.status == NodeStatus::Failed);
    if !failed {
        return RunOutcome::Success;
    }
    let progressed = reports
        .iter()
        .any(|r| r.kind != NodeKind::Trigger && r.status == NodeStatus::Succeeded);
    if progressed {
        RunOutcome::PartialFailure
    } else {
        RunOutcome::Failure
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

fn run_condition(node: &FlowNode, ctx: &Context) -> Step {
    let spec = Value::Object(
        node.params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    match condition_holds(ctx, &spec) {
        Ok(result) => {
            let taken = if result { branch::TRUE } else { branch::FALSE };
            Step::ok(json!({
                "field": node.param_str("field"),
                "operator": node.param_str("operator").unwrap_or("exists"),
                "result": result,
                "branch": taken,
            }))
        }
        Err(e) => Step::failed(e),
    }
}

/// Evaluate a `{field, operator, value}` object against the context.
fn condition_holds(ctx: &Context, spec: &Value) -> Result<bool, String> {
    let field = spec
        .get("field")
        .and_then(Value::as_str)
        .ok_or("condition has no `field`")?;
    let operator = spec.get("operator").and_then(Value::as_str).unwrap_or("exists");
    evaluate(lookup(ctx, field), operator, spec.get("value"))
}

fn evaluate(actual: Option<&Value>, operator: &str, expected: Option<&Value>) -> Result<bool, String> {
    let actual = actual.filter(|v| !v.is_null());
    let result = match operator {
        "exists" => actual.is_some(),
        "eq" => values_equal(actual, expected),
        "ne" => !values_equal(actual, expected),
        "gt" | "lt" => match (actual.and_then(as_number), expected.and_then(as_number)) {
            (Some(a), Some(b)) if operator == "gt" => a > b,
            (Some(a), Some(b)) => a < b,
            _ => false,
        },
        "contains" => match (actual, expected) {
            (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
            (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
            (Some(Value::Object(map)), Some(Value::String(key))) => map.contains_key(key),
            _ => false,
        },
        other => return Err(format!("unknown condition operator `{other}`")),
    };
    Ok(result)
}

fn values_equal(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (Some(a), Some(b)) => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => (x - y).abs() < f64::EPSILON,
            _ => a == b,
        },
        (None, None) | (None, Some(Value::Null)) => true,
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Dotted-path lookup; numeric segments index into arrays.
fn lookup<'a>(ctx: &'a Context, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = ctx.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Rendering and files
// ---------------------------------------------------------------------------

/// The message built so far, or the payload as JSON.
fn message_text(ctx: &Context) -> String {
    if let Some(message) = ctx.get("message").and_then(Value::as_str) {
        return message.to_string();
    }
    match ctx.get("payload") {
        Some(Value::Null) | None => String::new(),
        Some(payload) => serde_json::to_string_pretty(payload).unwrap_or_default(),
    }
}

/// HTML message listing the quotes (or search results) in the context.
fn format_message(title: &str, ctx: &Context, now: DateTime<Utc>) -> String {
    let mut out = format!("<b>{title}</b>\n\n");

    match ctx.get("quotes") {
        Some(Value::Array(quotes)) if !quotes.is_empty() => {
            out.push_str("Quotes:\n");
            for quote in quotes {
                let symbol = quote.get("symbol").and_then(Value::as_str).unwrap_or("?");
                let name = quote.get("name").and_then(Value::as_str).unwrap_or(symbol);
                let value = quote.get("value").and_then(as_number).unwrap_or_default();
                let pct = quote.get("change_pct").and_then(as_number).unwrap_or_default();
                let arrow = match pct {
                    p if p > 0.0 => "↑",
                    p if p < 0.0 => "↓",
                    _ => "→",
                };
                out.push_str(&format!(
                    "• {name}: {} {value:.2} ({arrow} {pct:.2}%)\n",
                    currency_sign(symbol)
                ));
            }
        }
        _ => {
            if let Some(results) = lookup(ctx, "search.results").and_then(Value::as_array) {
                out.push_str(&format!("Results: {}\n", results.len()));
            }
            if let Some(payload) = ctx.get("payload").filter(|p| !p.is_null()) {
                out.push_str(&serde_json::to_string_pretty(payload).unwrap_or_default());
                out.push('\n');
            }
        }
    }

    out.push_str(&format!("\nUpdated at: {} UTC", now.format("%d/%m/%Y %H:%M")));
    out
}

fn currency_sign(symbol: &str) -> &str {
    match symbol.rsplit('-').next().unwrap_or(symbol) {
        "BRL" => "R$",
        "USD" => "$",
        "EUR" => "€",
        "GBP" => "£",
        other => other,
    }
}

/// Lowercase file-name-safe slug.
fn sanitize(raw: &str, fallback: &str) -> String {
    let mut slug = String::new();
    for c in raw.chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c);
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_matches('-').chars().take(48).collect();
    if slug.is_empty() { fallback.to_string() } else { slug }
}

async fn append_line(path: &Path, line: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let mut bytes = serde_json::to_vec(line)?;
    bytes.push(b'\n');
    file.write_all(&bytes).await?;
    file.flush().await
}
