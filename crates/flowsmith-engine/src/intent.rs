//! Intent descriptor: the structured reading of a user's prompt.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// What the automation mainly does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Fetch,
    Transform,
    Send,
    Store,
    /// More than one of the above, or nothing identifiable.
    Hybrid,
}

/// Rough size of the flow the builder should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    /// Inclusive node-count range for this tier.
    pub fn node_range(self) -> (usize, usize) {
        match self {
            Self::Simple => (3, 4),
            Self::Medium => (5, 7),
            Self::Complex => (8, 10),
        }
    }
}

/// Where the result of a run ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Message,
    File,
    Notification,
    Database,
}

/// Which interpretation path produced a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Model,
    Keywords,
}

macro_rules! snake_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match serde_json::to_value(self) {
                    Ok(serde_json::Value::String(s)) => f.write_str(&s),
                    _ => write!(f, "{self:?}"),
                }
            }
        }
    };
}

snake_display!(ActionClass);
snake_display!(Complexity);
snake_display!(OutputKind);
snake_display!(IntentSource);

/// Structured intent extracted from a prompt. Created once per request and
/// never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDescriptor {
    /// Short statement of what the user wants.
    pub goal: String,
    pub action: ActionClass,
    pub complexity: Complexity,
    /// Integration names the flow must use.
    pub integrations: BTreeSet<String>,
    pub output: OutputKind,
    /// Set when no goal could be identified in the prompt.
    #[serde(default)]
    pub unresolved: bool,
    pub source: IntentSource,
}

impl IntentDescriptor {
    /// Integrations that deliver something (everything except `quote`).
    pub fn messaging_integrations(&self) -> impl Iterator<Item = &str> {
        self.integrations
            .iter()
            .map(String::as_str)
            .filter(|name| is_messaging(name))
    }

    pub fn wants(&self, integration: &str) -> bool {
        self.integrations.contains(integration)
    }
}

/// Whether `integration` delivers a message rather than fetching data.
pub fn is_messaging(integration: &str) -> bool {
    flowsmith_adapters::catalog::spec(integration).is_some_and(|spec| spec.capability.is_messaging())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_display_in_snake_case() {
        assert_eq!(ActionClass::Hybrid.to_string(), "hybrid");
        assert_eq!(OutputKind::Notification.to_string(), "notification");
        assert_eq!(IntentSource::Keywords.to_string(), "keywords");
    }

    #[test]
    fn complexity_tiers_do_not_overlap() {
        let tiers = [Complexity::Simple, Complexity::Medium, Complexity::Complex];
        for pair in tiers.windows(2) {
            assert!(pair[0].node_range().1 < pair[1].node_range().0);
        }
    }

    #[test]
    fn messaging_excludes_quote_and_unknown() {
        assert!(is_messaging("telegram"));
        assert!(is_messaging("email"));
        assert!(!is_messaging("quote"));
        assert!(!is_messaging("whatsapp"));
    }

    #[test]
    fn descriptor_lists_delivery_integrations_in_order() {
        let intent = IntentDescriptor {
            goal: "quote to chat".into(),
            action: ActionClass::Hybrid,
            complexity: Complexity::Simple,
            integrations: ["telegram", "quote", "email", "whatsapp"]
                .into_iter()
                .map(String::from)
                .collect(),
            output: OutputKind::Message,
            unresolved: false,
            source: IntentSource::Keywords,
        };
        let messaging: Vec<&str> = intent.messaging_integrations().collect();
        assert_eq!(messaging, vec!["email", "telegram"]);
        assert!(intent.wants("quote"));
    }
}
