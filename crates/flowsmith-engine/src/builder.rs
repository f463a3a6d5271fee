//! Flow builder: intent descriptor to a concrete [`Flow`].
//!
//! Nodes are laid out in a fixed order (trigger, fetch, transform,
//! condition, loop, delivery, storage, padding, output) and chained. A
//! repair pass then re-checks the graph invariants and the requested
//! integrations, so whatever comes out has exactly one trigger and a
//! reachable output.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use flowsmith_adapters::catalog;

use crate::flow::{Flow, FlowEdge, FlowMetadata, FlowNode, NodeKind, branch};
use crate::intent::{ActionClass, Complexity, IntentDescriptor, OutputKind};

/// Iterations requested by generated loop nodes.
const DEFAULT_LOOP_ITERATIONS: u64 = 5;

const MAX_NAME_CHARS: usize = 60;

/// Build a flow for `intent`. Never fails: unknown integrations are dropped
/// and structural gaps are repaired.
pub fn build_flow(intent: &IntentDescriptor, prompt: &str, now: DateTime<Utc>) -> Flow {
    let integrations: BTreeSet<String> = intent
        .integrations
        .iter()
        .filter(|name| {
            let known = catalog::is_known(name);
            if !known {
                warn!(integration = %name, "dropping unrecognized integration");
            }
            known
        })
        .cloned()
        .collect();

    let mut metadata = FlowMetadata::from(intent);
    metadata.requested_integrations = integrations.clone();

    let mut layout = Layout::default();
    layout.push(Step::Plain(
        FlowNode::new("trigger", NodeKind::Trigger, "Start").with_param("mode", "schedule"),
    ));

    // -- fetch ---------------------------------------------------------------
    let wants_quote = integrations.contains("quote");
    let messaging: Vec<&str> = intent.messaging_integrations().collect();
    let data_key = if wants_quote { "quotes" } else { "search.results" };
    let mut fetched = false;
    if wants_quote {
        layout.push(Step::Plain(
            layout
                .node(NodeKind::Search, "Fetch quotes")
                .with_param("source", "quote")
                .with_param("integration", "quote")
                .with_param("symbols", json!(quote_symbols(&intent.goal))),
        ));
        fetched = true;
    } else if matches!(intent.action, ActionClass::Fetch | ActionClass::Hybrid) {
        layout.push(Step::Plain(
            layout
                .node(NodeKind::Search, "Search")
                .with_param("source", "web")
                .with_param("query", intent.goal.clone()),
        ));
        fetched = true;
    }

    // -- transform -----------------------------------------------------------
    if matches!(intent.action, ActionClass::Transform | ActionClass::Hybrid)
        || (fetched && !messaging.is_empty())
    {
        layout.push(Step::Plain(
            layout
                .node(NodeKind::Transform, "Format message")
                .with_param("operation", "format"),
        ));
    }

    // -- control flow --------------------------------------------------------
    if intent.complexity >= Complexity::Medium {
        layout.push(Step::Condition(
            layout
                .node(NodeKind::Condition, "Check data")
                .with_param("field", data_key)
                .with_param("operator", "exists"),
        ));
    }
    if intent.complexity == Complexity::Complex {
        let head = layout
            .node(NodeKind::Loop, "For each item")
            .with_param("max_iterations", DEFAULT_LOOP_ITERATIONS)
            .with_param("over", data_key);
        layout.reserve_id();
        let body = layout
            .node(NodeKind::Transform, "Process item")
            .with_param("operation", "collect");
        layout.push(Step::Loop { head, body });
    }

    // -- delivery and storage ------------------------------------------------
    for &name in &messaging {
        let display = catalog::spec(name).map_or(name, |s| s.display_name);
        let mut node = layout
            .node(NodeKind::Integration, format!("Send via {display}"))
            .with_param("integration", name);
        if name == "email" {
            node = node.with_param("subject", title(&intent.goal));
        }
        layout.push(Step::Plain(node));
    }
    if intent.action == ActionClass::Store || intent.output == OutputKind::Database {
        layout.push(Step::Plain(
            layout
                .node(NodeKind::Database, "Store result")
                .with_param("table", "records"),
        ));
    }

    // -- padding and output --------------------------------------------------
    let (min_nodes, _) = intent.complexity.node_range();
    while layout.node_count() + 1 < min_nodes {
        layout.push(Step::Plain(
            layout
                .node(NodeKind::Transform, "Prepare result")
                .with_param("operation", "passthrough"),
        ));
    }

    let output = FlowNode::new("output", NodeKind::Output, output_label(intent.output))
        .with_param("kind", intent.output.to_string());
    let (nodes, edges) = layout.finish(output);

    let mut flow = Flow {
        id: Uuid::now_v7().to_string(),
        name: title(&intent.goal),
        description: intent.goal.clone(),
        nodes,
        edges,
        created_at: now,
        source_prompt: prompt.trim().to_string(),
        metadata,
    };
    repair(&mut flow);

    debug!(
        flow_id = %flow.id,
        nodes = flow.nodes.len(),
        edges = flow.edges.len(),
        "flow built"
    );
    flow
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

enum Step {
    Plain(FlowNode),
    /// `true` continues the chain, `false` jumps to the output.
    Condition(FlowNode),
    /// `body` loops back to `head`; `exit` continues the chain.
    Loop { head: FlowNode, body: FlowNode },
}

/// The chain's current tail and the branch label its next edge carries.
type Link = (String, Option<&'static str>);

fn link(edges: &mut Vec<FlowEdge>, prev: &Option<Link>, to: &str) {
    if let Some((from, label)) = prev {
        edges.push(match label {
            Some(label) => FlowEdge::labelled(from.clone(), to, label),
            None => FlowEdge::new(from.clone(), to),
        });
    }
}

#[derive(Default)]
struct Layout {
    steps: Vec<Step>,
    next_id: usize,
}

impl Layout {
    fn node(&self, kind: NodeKind, label: impl Into<String>) -> FlowNode {
        FlowNode::new(format!("{kind}_{}", self.next_id + 1), kind, label)
    }

    fn reserve_id(&mut self) {
        self.next_id += 1;
    }

    fn push(&mut self, step: Step) {
        self.next_id += 1;
        self.steps.push(step);
    }

    fn node_count(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s {
                Step::Loop { .. } => 2,
                _ => 1,
            })
            .sum()
    }

    fn finish(self, output: FlowNode) -> (Vec<FlowNode>, Vec<FlowEdge>) {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let mut conditions = Vec::new();
        let mut prev: Option<Link> = None;

        for step in self.steps {
            match step {
                Step::Plain(node) => {
                    link(&mut edges, &prev, &node.id);
                    prev = Some((node.id.clone(), None));
                    nodes.push(node);
                }
                Step::Condition(node) => {
                    link(&mut edges, &prev, &node.id);
                    conditions.push(node.id.clone());
                    prev = Some((node.id.clone(), Some(branch::TRUE)));
                    nodes.push(node);
                }
                Step::Loop { head, body } => {
                    link(&mut edges, &prev, &head.id);
                    edges.push(FlowEdge::labelled(head.id.clone(), body.id.clone(), branch::BODY));
                    edges.push(FlowEdge::loop_back(body.id.clone(), head.id.clone()));
                    prev = Some((head.id.clone(), Some(branch::EXIT)));
                    nodes.push(head);
                    nodes.push(body);
                }
            }
        }

        link(&mut edges, &prev, &output.id);
        for condition in conditions {
            edges.push(FlowEdge::labelled(condition, output.id.clone(), branch::FALSE));
        }
        nodes.push(output);
        (nodes, edges)
    }
}

// ---------------------------------------------------------------------------
// Repair
// ---------------------------------------------------------------------------

/// Restore the invariants a runnable flow needs: exactly one trigger, at
/// least one output, every requested integration used by some node, and
/// every node wired in.
pub fn repair(flow: &mut Flow) {
    ensure_single_trigger(flow);
    ensure_output(flow);
    ensure_integrations(flow);
    ensure_wired(flow);
}

fn fresh_id(flow: &Flow, kind: NodeKind) -> String {
    (1..)
        .map(|n| format!("{kind}_r{n}"))
        .find(|id| flow.node(id).is_none())
        .unwrap_or_else(|| format!("{kind}_{}", Uuid::now_v7()))
}

fn ensure_single_trigger(flow: &mut Flow) {
    let triggers: Vec<String> = flow
        .nodes_of(NodeKind::Trigger)
        .map(|n| n.id.clone())
        .collect();
    match triggers.as_slice() {
        [] => {
            let id = fresh_id(flow, NodeKind::Trigger);
            warn!(flow_id = %flow.id, "repair: inserting missing trigger");
            let entries: Vec<String> = flow
                .nodes
                .iter()
                .filter(|n| flow.incoming(&n.id).next().is_none())
                .map(|n| n.id.clone())
                .collect();
            flow.nodes.insert(0, FlowNode::new(id.clone(), NodeKind::Trigger, "Start"));
            for entry in entries {
                flow.edges.push(FlowEdge::new(id.clone(), entry));
            }
        }
        [_] => {}
        [keep, extra @ ..] => {
            warn!(flow_id = %flow.id, extra = extra.len(), "repair: merging extra triggers");
            for id in extra {
                for edge in flow.edges.iter_mut() {
                    if &edge.from == id {
                        edge.from = keep.clone();
                    }
                }
                flow.edges.retain(|e| &e.to != id);
                flow.nodes.retain(|n| &n.id != id);
            }
            dedup_edges(flow);
        }
    }
}

fn ensure_output(flow: &mut Flow) {
    if flow.count(NodeKind::Output) > 0 {
        return;
    }
    warn!(flow_id = %flow.id, "repair: inserting missing output");
    let id = fresh_id(flow, NodeKind::Output);
    let kind = flow.metadata.output_kind;
    flow.nodes.push(
        FlowNode::new(id, NodeKind::Output, output_label(kind)).with_param("kind", kind.to_string()),
    );
}

fn ensure_integrations(flow: &mut Flow) {
    let used = flow.used_integrations();
    let missing: Vec<String> = flow
        .metadata
        .requested_integrations
        .iter()
        .filter(|name| catalog::is_known(name) && !used.contains(*name))
        .cloned()
        .collect();

    for name in missing {
        warn!(flow_id = %flow.id, integration = %name, "repair: adding node for requested integration");
        if name == "quote" {
            let id = fresh_id(flow, NodeKind::Search);
            let node = FlowNode::new(id, NodeKind::Search, "Fetch quotes")
                .with_param("source", "quote")
                .with_param("integration", "quote")
                .with_param("symbols", json!(quote_symbols(&flow.metadata.goal)));
            insert_after_trigger(flow, node);
        } else {
            let id = fresh_id(flow, NodeKind::Integration);
            let node = FlowNode::new(id, NodeKind::Integration, format!("Send via {name}"))
                .with_param("integration", name.as_str());
            insert_before_output(flow, node);
        }
    }
}

fn insert_after_trigger(flow: &mut Flow, node: FlowNode) {
    let Some(trigger) = flow.nodes_of(NodeKind::Trigger).next().map(|n| n.id.clone()) else {
        return;
    };
    for edge in flow.edges.iter_mut().filter(|e| e.from == trigger) {
        edge.from = node.id.clone();
    }
    flow.edges.push(FlowEdge::new(trigger.clone(), node.id.clone()));
    let at = flow.nodes.iter().position(|n| n.id == trigger).map_or(0, |i| i + 1);
    flow.nodes.insert(at, node);
}

fn insert_before_output(flow: &mut Flow, node: FlowNode) {
    let Some(output) = flow.nodes_of(NodeKind::Output).next().map(|n| n.id.clone()) else {
        return;
    };
    for edge in flow
        .edges
        .iter_mut()
        .filter(|e| e.to == output && e.branch.as_deref() != Some(branch::FALSE))
    {
        edge.to = node.id.clone();
    }
    flow.edges.push(FlowEdge::new(node.id.clone(), output.clone()));
    let at = flow.nodes.iter().position(|n| n.id == output).unwrap_or(flow.nodes.len());
    flow.nodes.insert(at, node);
}

/// Connect stranded nodes: entries without an incoming edge hang off the
/// trigger, dead ends without an outgoing edge feed the first output.
fn ensure_wired(flow: &mut Flow) {
    let trigger = flow.nodes_of(NodeKind::Trigger).next().map(|n| n.id.clone());
    let output = flow.nodes_of(NodeKind::Output).next().map(|n| n.id.clone());

    let mut added = Vec::new();
    for node in &flow.nodes {
        if let Some(trigger) = &trigger
            && node.kind != NodeKind::Trigger
            && flow.incoming(&node.id).next().is_none()
        {
            added.push(FlowEdge::new(trigger.clone(), node.id.clone()));
        }
        if let Some(output) = &output
            && node.kind != NodeKind::Output
            && flow.outgoing(&node.id).next().is_none()
        {
            added.push(FlowEdge::new(node.id.clone(), output.clone()));
        }
    }
    if !added.is_empty() {
        debug!(flow_id = %flow.id, edges = added.len(), "repair: wiring stranded nodes");
        flow.edges.extend(added);
    }

    if let (Some(trigger), Some(output)) = (trigger, output)
        && !flow.reachable_from(&trigger).contains(&output)
        && flow.topological_order().is_some()
    {
        warn!(flow_id = %flow.id, "repair: output unreachable, linking trigger to output");
        flow.edges.push(FlowEdge::new(trigger, output));
    }
}

fn dedup_edges(flow: &mut Flow) {
    let mut seen = Vec::with_capacity(flow.edges.len());
    flow.edges.retain(|e| {
        if seen.contains(e) {
            false
        } else {
            seen.push(e.clone());
            true
        }
    });
}

// ---------------------------------------------------------------------------
// Naming helpers
// ---------------------------------------------------------------------------

/// Currency pairs mentioned in `goal`, USD-BRL when none is recognizable.
pub fn quote_symbols(goal: &str) -> Vec<String> {
    let lower = goal.to_lowercase();
    let words: Vec<&str> = lower.split(|c: char| !c.is_alphanumeric()).collect();
    let mentions = |names: &[&str]| names.iter().any(|n| words.contains(n));

    let mut symbols = Vec::new();
    if mentions(&["dollar", "dollars", "dólar", "dolar", "usd"]) {
        symbols.push("USD-BRL".to_string());
    }
    if mentions(&["euro", "euros", "eur"]) {
        symbols.push("EUR-BRL".to_string());
    }
    if mentions(&["bitcoin", "btc"]) {
        symbols.push("BTC-BRL".to_string());
    }
    if symbols.is_empty() {
        symbols.push("USD-BRL".to_string());
    }
    symbols
}

fn output_label(kind: OutputKind) -> &'static str {
    match kind {
        OutputKind::Message => "Deliver message",
        OutputKind::File => "Write file",
        OutputKind::Notification => "Notify",
        OutputKind::Database => "Finish",
    }
}

/// A flow name from its goal: first letter upper-cased, length capped.
fn title(goal: &str) -> String {
    let trimmed = goal.trim().trim_end_matches('…');
    let capped: String = trimmed.chars().take(MAX_NAME_CHARS).collect();
    let mut chars = capped.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Untitled flow".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::KeywordClassifier;
    use crate::intent::IntentSource;

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn build(prompt: &str) -> Flow {
        let intent = KeywordClassifier::new().classify(prompt);
        build_flow(&intent, prompt, now())
    }

    fn intent(action: ActionClass, complexity: Complexity, integrations: &[&str]) -> IntentDescriptor {
        IntentDescriptor {
            goal: "watch the euro".into(),
            action,
            complexity,
            integrations: integrations.iter().map(|s| s.to_string()).collect(),
            output: OutputKind::Message,
            unresolved: false,
            source: IntentSource::Keywords,
        }
    }

    #[test]
    fn dollar_scenario_is_trigger_search_output() {
        let flow = build("send me the dollar quote every morning at a fixed interval");
        assert_eq!(
            flow.kinds(),
            vec![NodeKind::Trigger, NodeKind::Search, NodeKind::Output]
        );
        let search = &flow.nodes[1];
        assert_eq!(search.integration(), Some("quote"));
        assert_eq!(search.params["symbols"], json!(["USD-BRL"]));
        assert!(flow.structural_errors().is_empty());
    }

    #[test]
    fn tiers_respect_node_ranges() {
        for (complexity, integrations) in [
            (Complexity::Simple, vec!["quote"]),
            (Complexity::Medium, vec!["quote", "telegram"]),
            (Complexity::Complex, vec!["quote", "telegram"]),
        ] {
            let flow = build_flow(&intent(ActionClass::Hybrid, complexity, &integrations), "p", now());
            let (min, max) = complexity.node_range();
            assert!(
                (min..=max).contains(&flow.nodes.len()),
                "{complexity}: {:?}",
                flow.kinds()
            );
            assert!(flow.structural_errors().is_empty(), "{:?}", flow.structural_errors());
        }
    }

    #[test]
    fn medium_flow_has_condition_with_both_branches() {
        let flow = build_flow(&intent(ActionClass::Hybrid, Complexity::Medium, &["quote", "telegram"]), "p", now());
        let condition = flow.nodes_of(NodeKind::Condition).next().unwrap();
        let labels: BTreeSet<_> = flow
            .outgoing(&condition.id)
            .filter_map(|e| e.branch.as_deref())
            .collect();
        assert_eq!(labels, BTreeSet::from(["true", "false"]));
    }

    #[test]
    fn complex_flow_has_one_loop_back_edge() {
        let flow = build_flow(&intent(ActionClass::Hybrid, Complexity::Complex, &["quote", "slack"]), "p", now());
        let loop_backs: Vec<_> = flow.edges.iter().filter(|e| e.is_loop_back).collect();
        assert_eq!(loop_backs.len(), 1);
        assert_eq!(flow.node(&loop_backs[0].to).unwrap().kind, NodeKind::Loop);
        assert!(flow.structural_errors().is_empty());
    }

    #[test]
    fn unknown_integrations_are_dropped() {
        let flow = build_flow(&intent(ActionClass::Send, Complexity::Simple, &["whatsapp", "telegram"]), "p", now());
        assert!(!flow.metadata.requested_integrations.contains("whatsapp"));
        assert_eq!(flow.used_integrations(), BTreeSet::from(["telegram".to_string()]));
    }

    #[test]
    fn unresolved_prompt_still_builds_runnable_flow() {
        let flow = build("please do something");
        assert_eq!(flow.count(NodeKind::Trigger), 1);
        assert!(flow.count(NodeKind::Output) >= 1);
        assert!(flow.structural_errors().is_empty());
    }

    #[test]
    fn repair_restores_trigger_output_and_integrations() {
        let mut flow = build_flow(&intent(ActionClass::Send, Complexity::Simple, &["telegram"]), "p", now());
        flow.nodes.retain(|n| !matches!(n.kind, NodeKind::Trigger | NodeKind::Output | NodeKind::Integration));
        flow.edges.clear();
        flow.nodes.push(FlowNode::new("orphan", NodeKind::Transform, "orphan"));

        repair(&mut flow);

        assert_eq!(flow.count(NodeKind::Trigger), 1);
        assert_eq!(flow.count(NodeKind::Output), 1);
        assert!(flow.used_integrations().contains("telegram"));
        assert!(flow.structural_errors().is_empty(), "{:?}", flow.structural_errors());
    }

    #[test]
    fn repair_merges_duplicate_triggers() {
        let mut flow = build("send me the dollar quote");
        flow.nodes.push(FlowNode::new("t2", NodeKind::Trigger, "second"));
        flow.edges.push(FlowEdge::new("t2", "output"));
        repair(&mut flow);
        assert_eq!(flow.count(NodeKind::Trigger), 1);
        assert!(flow.structural_errors().is_empty());
    }

    #[test]
    fn symbols_follow_goal() {
        assert_eq!(quote_symbols("euro and dollar"), vec!["USD-BRL", "EUR-BRL"]);
        assert_eq!(quote_symbols("cotação"), vec!["USD-BRL"]);
        assert_eq!(quote_symbols("bitcoin price"), vec!["BTC-BRL"]);
    }

    #[test]
    fn title_capitalizes_and_caps() {
        assert_eq!(title("send the report"), "Send the report");
        assert_eq!(title(""), "Untitled flow");
        assert_eq!(title(&"x".repeat(100)).chars().count(), MAX_NAME_CHARS);
    }
}
