//! Flow validator.
//!
//! Scores a flow on a 0-100 scale as a pure function of the flow and a
//! [`ValidationPolicy`]. Three rule layers contribute penalties:
//!
//! | Layer | Kind | Penalty |
//! |-------|------|---------|
//! | graph invariants | hard error | 40 each |
//! | output kind vs. requested integrations | warning | 10 |
//! | requested integration with no node | warning | 15 |
//! | transform intent without a transform step | warning | 5 |
//! | condition without both branch labels | warning | 5 |
//! | loop without `max_iterations` | warning | 5 |
//! | node naming an unknown integration | hard error | 30 each |
//!
//! Warnings never block persistence or execution; hard errors do.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use flowsmith_adapters::catalog;

use crate::flow::{Flow, NodeKind, branch};
use crate::intent::{ActionClass, OutputKind, is_messaging};

const STRUCTURAL_PENALTY: u32 = 40;
const UNKNOWN_INTEGRATION_PENALTY: u32 = 30;
const OUTPUT_MISMATCH_PENALTY: u32 = 10;
const UNUSED_INTEGRATION_PENALTY: u32 = 15;
const MISSING_TRANSFORM_PENALTY: u32 = 5;
const UNLABELLED_CONDITION_PENALTY: u32 = 5;
const UNBOUNDED_LOOP_PENALTY: u32 = 5;

/// Score thresholds. `[validation]` in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationPolicy {
    /// Scores at or above this are accepted outright.
    pub accept_threshold: u32,
    /// Scores below this are rejected.
    pub reject_floor: u32,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            accept_threshold: 70,
            reject_floor: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    AcceptedWithWarnings,
    Rejected,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::AcceptedWithWarnings => "accepted_with_warnings",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub score: u32,
    pub verdict: Verdict,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    /// Whether the flow may be persisted as an automation and run.
    pub fn is_runnable(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate `flow` against `policy`.
pub fn validate(flow: &Flow, policy: &ValidationPolicy) -> ValidationResult {
    let mut penalty = 0u32;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // -- layer 1: structure ----------------------------------------------------
    for error in flow.structural_errors() {
        penalty += STRUCTURAL_PENALTY;
        errors.push(error);
    }

    // -- layer 2: semantics ----------------------------------------------------
    let meta = &flow.metadata;
    let messaging: Vec<&String> = meta
        .requested_integrations
        .iter()
        .filter(|n| is_messaging(n))
        .collect();

    if !messaging.is_empty()
        && !matches!(meta.output_kind, OutputKind::Message | OutputKind::Notification)
    {
        penalty += OUTPUT_MISMATCH_PENALTY;
        warnings.push(format!(
            "output kind `{}` does not match requested delivery via {}",
            meta.output_kind,
            messaging
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if meta.output_kind == OutputKind::Database && flow.count(NodeKind::Database) == 0 {
        penalty += OUTPUT_MISMATCH_PENALTY;
        warnings.push("output kind `database` but the flow has no database step".into());
    }

    let used = flow.used_integrations();
    for name in &meta.requested_integrations {
        if !used.contains(&name.to_ascii_lowercase()) {
            penalty += UNUSED_INTEGRATION_PENALTY;
            warnings.push(format!("requested integration `{name}` is not used by any node"));
        }
    }

    if matches!(meta.action, ActionClass::Transform | ActionClass::Hybrid) && !has_transform_path(flow) {
        penalty += MISSING_TRANSFORM_PENALTY;
        warnings.push("no transform step between the data source and the output".into());
    }

    for node in flow.nodes_of(NodeKind::Condition) {
        let labels: HashSet<&str> = flow
            .outgoing(&node.id)
            .filter_map(|e| e.branch.as_deref())
            .collect();
        if !(labels.contains(branch::TRUE) && labels.contains(branch::FALSE)) {
            penalty += UNLABELLED_CONDITION_PENALTY;
            warnings.push(format!(
                "condition `{}` lacks a true/false branch label",
                node.id
            ));
        }
    }

    for node in flow.nodes_of(NodeKind::Loop) {
        if !node
            .params
            .get("max_iterations")
            .and_then(|v| v.as_u64())
            .is_some_and(|n| n >= 1)
        {
            penalty += UNBOUNDED_LOOP_PENALTY;
            warnings.push(format!("loop `{}` has no max_iterations", node.id));
        }
    }

    // -- layer 3: integrations -------------------------------------------------
    for node in &flow.nodes {
        if let Some(name) = node.integration()
            && !catalog::is_known(name)
        {
            penalty += UNKNOWN_INTEGRATION_PENALTY;
            errors.push(format!("node `{}` uses unknown integration `{name}`", node.id));
        }
    }

    let score = 100u32.saturating_sub(penalty);
    let verdict = if score < policy.reject_floor {
        Verdict::Rejected
    } else if score >= policy.accept_threshold && errors.is_empty() {
        Verdict::Accepted
    } else {
        Verdict::AcceptedWithWarnings
    };

    ValidationResult {
        score,
        verdict,
        warnings,
        errors,
    }
}

/// Some transform sits downstream of a search (or of anything, when the
/// flow has no search) and upstream of an output.
fn has_transform_path(flow: &Flow) -> bool {
    let searches: Vec<_> = flow.nodes_of(NodeKind::Search).collect();
    let after_search: HashSet<String> = searches
        .iter()
        .flat_map(|s| flow.reachable_from(&s.id))
        .collect();

    flow.nodes_of(NodeKind::Transform).any(|t| {
        let fed = searches.is_empty() || after_search.contains(&t.id);
        fed && flow
            .reachable_from(&t.id)
            .iter()
            .any(|id| flow.node(id).is_some_and(|n| n.kind == NodeKind::Output))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build_flow;
    use crate::flow::tests::flow;
    use crate::flow::{FlowEdge, FlowNode};
    use crate::interpreter::KeywordClassifier;
    use chrono::DateTime;

    fn generated(prompt: &str) -> Flow {
        let intent = KeywordClassifier::new().classify(prompt);
        build_flow(&intent, prompt, DateTime::from_timestamp(1_700_000_000, 0).unwrap())
    }

    #[test]
    fn dollar_flow_is_accepted_with_full_score() {
        let result = validate(
            &generated("send me the dollar quote every morning at a fixed interval"),
            &ValidationPolicy::default(),
        );
        assert_eq!(result.score, 100, "{result:?}");
        assert_eq!(result.verdict, Verdict::Accepted);
        assert!(result.is_runnable());
    }

    #[test]
    fn generated_flows_never_score_below_floor() {
        let prompts = [
            "send me the dollar quote every morning at a fixed interval",
            "Envie a cotação do dólar e do euro pelo Telegram",
            "for each currency, if the euro is above 6 send it to slack and email and store in the database",
            "summarize the weekly report as html",
            "please do something",
            "alert me when the dollar drops below 5 via slack",
            "track bitcoin and persist it in a table",
            "x",
        ];
        for prompt in prompts {
            let result = validate(&generated(prompt), &ValidationPolicy::default());
            assert!(result.score >= 30, "{prompt}: {result:?}");
            assert!(result.errors.is_empty(), "{prompt}: {result:?}");
        }
    }

    #[test]
    fn validation_is_pure() {
        let f = generated("for each currency, if the euro is above 6 send it to slack");
        let policy = ValidationPolicy::default();
        assert_eq!(validate(&f, &policy), validate(&f, &policy));
    }

    #[test]
    fn structural_errors_cost_forty_each() {
        let f = flow(vec![FlowNode::new("s", NodeKind::Search, "alone")], vec![]);
        let result = validate(&f, &ValidationPolicy::default());
        // no trigger, no output, no incoming, no outgoing
        assert_eq!(result.errors.len(), 4);
        assert_eq!(result.score, 0);
        assert_eq!(result.verdict, Verdict::Rejected);
        assert!(!result.is_runnable());
    }

    #[test]
    fn unknown_integration_is_hard_error() {
        let f = flow(
            vec![
                FlowNode::new("t", NodeKind::Trigger, "start"),
                FlowNode::new("i", NodeKind::Integration, "send").with_param("integration", "whatsapp"),
                FlowNode::new("o", NodeKind::Output, "done"),
            ],
            vec![FlowEdge::new("t", "i"), FlowEdge::new("i", "o")],
        );
        let result = validate(&f, &ValidationPolicy::default());
        assert_eq!(result.score, 70);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.verdict, Verdict::AcceptedWithWarnings);
        assert!(!result.is_runnable());
    }

    #[test]
    fn semantic_rules_warn_without_blocking() {
        let mut f = flow(
            vec![
                FlowNode::new("t", NodeKind::Trigger, "start"),
                FlowNode::new("c", NodeKind::Condition, "check"),
                FlowNode::new("l", NodeKind::Loop, "repeat"),
                FlowNode::new("b", NodeKind::Transform, "body"),
                FlowNode::new("o", NodeKind::Output, "done"),
            ],
            vec![
                FlowEdge::new("t", "c"),
                FlowEdge::new("c", "l"),
                FlowEdge::labelled("l", "b", branch::BODY),
                FlowEdge::loop_back("b", "l"),
                FlowEdge::labelled("l", "o", branch::EXIT),
            ],
        );
        f.metadata.requested_integrations.insert("telegram".into());
        f.metadata.output_kind = OutputKind::File;

        let result = validate(&f, &ValidationPolicy::default());
        assert!(result.errors.is_empty(), "{result:?}");
        // output mismatch 10 + unused telegram 15 + condition labels 5 + loop bound 5
        assert_eq!(result.score, 65);
        assert_eq!(result.warnings.len(), 4);
        assert_eq!(result.verdict, Verdict::AcceptedWithWarnings);
        assert!(result.is_runnable());
    }

    #[test]
    fn thresholds_are_configurable() {
        let f = generated("send me the dollar quote every morning at a fixed interval");
        let strict = ValidationPolicy {
            accept_threshold: 101,
            reject_floor: 0,
        };
        assert_eq!(validate(&f, &strict).verdict, Verdict::AcceptedWithWarnings);

        let harsh = ValidationPolicy {
            accept_threshold: 101,
            reject_floor: 101,
        };
        assert_eq!(validate(&f, &harsh).verdict, Verdict::Rejected);
    }
}
