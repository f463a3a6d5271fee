//! Core integration trait and the typed actions it carries.
//!
//! Each integration provides exactly one [`Capability`]. The executor
//! builds an [`ActionRequest`] from a flow node and hands it to the
//! integration registered under the node's integration name.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// The external action an integration performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Send a text message through a chat bot.
    MessagingBotSend,
    /// Fetch the current value of a quoted symbol.
    QuoteFetch,
    /// Send an email.
    EmailSend,
    /// Post a message to a team channel.
    ChannelNotify,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessagingBotSend => write!(f, "messaging-bot-send"),
            Self::QuoteFetch => write!(f, "quote-fetch"),
            Self::EmailSend => write!(f, "email-send"),
            Self::ChannelNotify => write!(f, "channel-notify"),
        }
    }
}

impl Capability {
    /// Capabilities that deliver something to a person.
    pub fn is_messaging(self) -> bool {
        !matches!(self, Self::QuoteFetch)
    }
}

/// The health status of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Reachable but not fully usable (e.g. no default target configured).
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and results
// ---------------------------------------------------------------------------

/// A typed call into one capability.
///
/// Optional targets fall back to the integration's configured default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    BotMessage {
        target: Option<String>,
        text: String,
    },
    QuoteFetch {
        symbol: String,
    },
    Email {
        to: Option<String>,
        subject: String,
        body: String,
    },
    ChannelNotify {
        channel: Option<String>,
        text: String,
    },
}

impl ActionRequest {
    /// The capability this request needs.
    pub fn capability(&self) -> Capability {
        match self {
            Self::BotMessage { .. } => Capability::MessagingBotSend,
            Self::QuoteFetch { .. } => Capability::QuoteFetch,
            Self::Email { .. } => Capability::EmailSend,
            Self::ChannelNotify { .. } => Capability::ChannelNotify,
        }
    }
}

/// Confirmation that a message left the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub integration: String,
    pub target: String,
    /// Provider-side message identifier, when the provider returns one.
    pub message_id: Option<String>,
}

/// A quoted value at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Normalized pair, e.g. `USD-BRL`.
    pub symbol: String,
    pub name: String,
    pub value: f64,
    /// Percentage change reported by the provider (0 when unknown).
    pub change_pct: f64,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Which provider answered.
    pub provider: String,
}

/// What a successful action produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutput {
    Delivered(DeliveryReceipt),
    Quote(Quote),
}

impl ActionOutput {
    /// JSON form used in execution reports and flow context.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Core trait
// ---------------------------------------------------------------------------

/// The interface every integration implements.
///
/// Calls must be safe to retry: the executor may repeat a failed call once.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Registry name, e.g. `telegram`.
    fn name(&self) -> &str;

    /// The single capability this integration provides.
    fn capability(&self) -> Capability;

    /// Whether the credentials the integration needs are present.
    fn is_configured(&self) -> bool;

    /// Probe the backing service.
    async fn health_check(&self) -> Result<HealthStatus>;

    /// Perform one action.
    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_names_are_kebab_case() {
        assert_eq!(Capability::MessagingBotSend.to_string(), "messaging-bot-send");
        assert_eq!(
            serde_json::to_value(Capability::QuoteFetch).unwrap(),
            serde_json::json!("quote-fetch")
        );
    }

    #[test]
    fn requests_map_to_capabilities() {
        let req = ActionRequest::Email {
            to: None,
            subject: "s".into(),
            body: "b".into(),
        };
        assert_eq!(req.capability(), Capability::EmailSend);
        assert!(req.capability().is_messaging());
        assert!(!Capability::QuoteFetch.is_messaging());
    }

    #[test]
    fn output_json_is_tagged() {
        let out = ActionOutput::Delivered(DeliveryReceipt {
            integration: "slack".into(),
            target: "C1".into(),
            message_id: Some("1.2".into()),
        });
        let json = out.to_json();
        assert_eq!(json["kind"], "delivered");
        assert_eq!(json["target"], "C1");
    }
}
