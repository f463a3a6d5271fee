//! Flow model: typed nodes, labelled edges, and the graph checks shared by
//! the builder and the validator.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::intent::{ActionClass, Complexity, IntentDescriptor, OutputKind};

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

/// The fixed node vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Trigger,
    Search,
    Transform,
    Condition,
    Loop,
    Integration,
    Database,
    Output,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trigger => "trigger",
            Self::Search => "search",
            Self::Transform => "transform",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Integration => "integration",
            Self::Database => "database",
            Self::Output => "output",
        };
        f.write_str(name)
    }
}

/// One step of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    /// Unique within the flow.
    pub id: String,
    pub kind: NodeKind,
    pub label: String,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
}

impl FlowNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    /// The integration this node claims to use, if any.
    pub fn integration(&self) -> Option<&str> {
        self.param_str("integration")
    }
}

/// Branch labels used on condition and loop edges.
pub mod branch {
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const BODY: &str = "body";
    pub const EXIT: &str = "exit";
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Marks the one edge that closes a loop back to its `loop` node.
    #[serde(default)]
    pub is_loop_back: bool,
}

impl FlowEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            branch: None,
            is_loop_back: false,
        }
    }

    pub fn labelled(from: impl Into<String>, to: impl Into<String>, branch: &str) -> Self {
        Self {
            branch: Some(branch.to_string()),
            ..Self::new(from, to)
        }
    }

    pub fn loop_back(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            is_loop_back: true,
            ..Self::new(from, to)
        }
    }
}

// ---------------------------------------------------------------------------
// Flow
// ---------------------------------------------------------------------------

/// Snapshot of the intent a flow was built from, kept so validation is a
/// pure function of the flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub action: ActionClass,
    pub complexity: Complexity,
    pub requested_integrations: BTreeSet<String>,
    pub output_kind: OutputKind,
    pub goal: String,
}

impl From<&IntentDescriptor> for FlowMetadata {
    fn from(intent: &IntentDescriptor) -> Self {
        Self {
            action: intent.action,
            complexity: intent.complexity,
            requested_integrations: intent.integrations.clone(),
            output_kind: intent.output,
            goal: intent.goal.clone(),
        }
    }
}

/// A generated automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub created_at: DateTime<Utc>,
    pub source_prompt: String,
    pub metadata: FlowMetadata,
}

impl Flow {
    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn nodes_of(&self, kind: NodeKind) -> impl Iterator<Item = &FlowNode> {
        self.nodes.iter().filter(move |n| n.kind == kind)
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes_of(kind).count()
    }

    /// Node kinds in declaration order.
    pub fn kinds(&self) -> Vec<NodeKind> {
        self.nodes.iter().map(|n| n.kind).collect()
    }

    pub fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |e| e.to == id)
    }

    /// Integration names claimed by any node.
    pub fn used_integrations(&self) -> BTreeSet<String> {
        self.nodes
            .iter()
            .filter_map(|n| n.integration())
            .map(str::to_ascii_lowercase)
            .collect()
    }

    /// Node ids in topological order over non-loop-back edges, ties broken
    /// by declaration order. `None` when those edges contain a cycle.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let index: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .rev()
            .map(|(i, n)| (n.id.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.nodes.len()];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for edge in self.edges.iter().filter(|e| !e.is_loop_back) {
            if let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) {
                adjacency[from].push(to);
                indegree[to] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.nodes.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(next) = ready.pop_first() {
            order.push(self.nodes[next].id.clone());
            for &to in &adjacency[next] {
                indegree[to] -= 1;
                if indegree[to] == 0 {
                    ready.insert(to);
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }

    /// Ids reachable from `start` over non-loop-back edges, `start` included.
    pub fn reachable_from(&self, start: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for edge in self.outgoing(&id).filter(|e| !e.is_loop_back) {
                if !seen.contains(&edge.to) {
                    queue.push_back(edge.to.clone());
                }
            }
        }
        seen
    }

    /// Nodes reached from the loop's `body` edges, stopping at the nodes
    /// that loop back to it.
    pub fn loop_body(&self, loop_id: &str) -> HashSet<String> {
        let mut members = HashSet::new();
        let mut queue: VecDeque<String> = self
            .outgoing(loop_id)
            .filter(|e| !e.is_loop_back && e.branch.as_deref() == Some(branch::BODY))
            .map(|e| e.to.clone())
            .collect();

        while let Some(id) = queue.pop_front() {
            if id == loop_id || !members.insert(id.clone()) {
                continue;
            }
            let closes_loop = self.outgoing(&id).any(|e| e.is_loop_back && e.to == loop_id);
            if closes_loop {
                continue;
            }
            for edge in self.outgoing(&id).filter(|e| !e.is_loop_back) {
                queue.push_back(edge.to.clone());
            }
        }
        members
    }

    /// Every violated graph invariant, one message each. Empty when the
    /// flow is structurally sound.
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                errors.push(format!("duplicate node id `{}`", node.id));
            }
        }

        let triggers: Vec<_> = self.nodes_of(NodeKind::Trigger).collect();
        match triggers.len() {
            0 => errors.push("flow has no trigger node".into()),
            1 => {}
            n => errors.push(format!("flow has {n} trigger nodes, expected exactly one")),
        }
        if self.count(NodeKind::Output) == 0 {
            errors.push("flow has no output node".into());
        }

        let mut dangling = false;
        for edge in &self.edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    dangling = true;
                    errors.push(format!(
                        "edge {} -> {} references unknown node `{end}`",
                        edge.from, edge.to
                    ));
                }
            }
            if edge.is_loop_back
                && self
                    .node(&edge.to)
                    .is_some_and(|target| target.kind != NodeKind::Loop)
            {
                errors.push(format!(
                    "loop-back edge {} -> {} does not target a loop node",
                    edge.from, edge.to
                ));
            }
        }

        for node in self.nodes_of(NodeKind::Loop) {
            let backs: Vec<&FlowEdge> = self
                .incoming(&node.id)
                .filter(|e| e.is_loop_back)
                .collect();
            match backs.as_slice() {
                [] => errors.push(format!("loop `{}` has no loop-back edge", node.id)),
                [back] => {
                    if !self.loop_body(&node.id).contains(&back.from) {
                        errors.push(format!(
                            "loop-back edge {} -> {} does not start inside the loop body",
                            back.from, back.to
                        ));
                    }
                }
                many => errors.push(format!(
                    "loop `{}` has {} loop-back edges, expected exactly one",
                    node.id,
                    many.len()
                )),
            }
        }

        let acyclic = self.topological_order().is_some();
        if !acyclic {
            errors.push("flow contains a cycle outside a loop-back edge".into());
        }

        for node in &self.nodes {
            if node.kind != NodeKind::Trigger && self.incoming(&node.id).next().is_none() {
                errors.push(format!("node `{}` has no incoming edge", node.id));
            }
            if node.kind != NodeKind::Output && self.outgoing(&node.id).next().is_none() {
                errors.push(format!("node `{}` has no outgoing edge", node.id));
            }
        }

        if let [trigger] = triggers.as_slice()
            && acyclic
            && !dangling
            && self.count(NodeKind::Output) > 0
        {
            let reachable = self.reachable_from(&trigger.id);
            if !self
                .nodes_of(NodeKind::Output)
                .any(|out| reachable.contains(&out.id))
            {
                errors.push("no output node is reachable from the trigger".into());
            }
        }

        errors
    }

    /// The flow as a JSON value for storage.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}
