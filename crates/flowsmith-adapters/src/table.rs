//! Name-keyed table of live integrations.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::Credentials;
use crate::email::SmtpMailer;
use crate::error::{AdapterError, Result};
use crate::quote::QuoteFeed;
use crate::slack::SlackChannel;
use crate::telegram::TelegramBot;
use crate::traits::{ActionOutput, ActionRequest, Integration};

/// Maps integration names to implementations. The executor resolves every
/// integration node through this table, so tests can swap in stubs.
#[derive(Default, Clone)]
pub struct CapabilityTable {
    integrations: HashMap<String, Arc<dyn Integration>>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in integrations, configured from `credentials`.
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        Ok(Self::new()
            .with(Arc::new(TelegramBot::from_credentials(credentials)))
            .with(Arc::new(QuoteFeed::new()))
            .with(Arc::new(SmtpMailer::from_credentials(credentials)?))
            .with(Arc::new(SlackChannel::from_credentials(credentials))))
    }

    /// Register `integration` under its own name, replacing any previous one.
    pub fn register(&mut self, integration: Arc<dyn Integration>) {
        let name = integration.name().to_ascii_lowercase();
        debug!(integration = %name, capability = %integration.capability(), "registering integration");
        self.integrations.insert(name, integration);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, integration: Arc<dyn Integration>) -> Self {
        self.register(integration);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Integration>> {
        self.integrations.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.integrations.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Run `request` on the integration registered as `name`.
    pub async fn invoke(&self, name: &str, request: ActionRequest) -> Result<ActionOutput> {
        let integration = self.get(name).ok_or_else(|| AdapterError::NotRegistered {
            integration: name.to_string(),
        })?;
        integration.invoke(request).await
    }
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityTable")
            .field("integrations", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{Capability, DeliveryReceipt, HealthStatus};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Integration for Echo {
        fn name(&self) -> &str {
            "Echo"
        }
        fn capability(&self) -> Capability {
            Capability::ChannelNotify
        }
        fn is_configured(&self) -> bool {
            true
        }
        async fn health_check(&self) -> Result<HealthStatus> {
            Ok(HealthStatus::Healthy)
        }
        async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput> {
            let ActionRequest::ChannelNotify { text, .. } = request else {
                return Err(AdapterError::Unsupported {
                    integration: "echo".into(),
                    capability: "other".into(),
                });
            };
            Ok(ActionOutput::Delivered(DeliveryReceipt {
                integration: "echo".into(),
                target: text,
                message_id: None,
            }))
        }
    }

    #[tokio::test]
    async fn invoke_dispatches_by_name() {
        let table = CapabilityTable::new().with(Arc::new(Echo));
        let out = table
            .invoke(
                "ECHO",
                ActionRequest::ChannelNotify {
                    channel: None,
                    text: "ping".into(),
                },
            )
            .await
            .unwrap();
        match out {
            ActionOutput::Delivered(receipt) => assert_eq!(receipt.target, "ping"),
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_name_is_not_registered() {
        let err = CapabilityTable::new()
            .invoke(
                "telegram",
                ActionRequest::BotMessage {
                    target: None,
                    text: "x".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotRegistered { .. }));
    }

    #[test]
    fn builtins_register_under_catalog_names() {
        let table = CapabilityTable::from_credentials(&Credentials::default()).unwrap();
        assert_eq!(table.names(), vec!["email", "quote", "slack", "telegram"]);
        assert!(table.get("quote").unwrap().is_configured());
        assert!(!table.get("telegram").unwrap().is_configured());
    }
}
