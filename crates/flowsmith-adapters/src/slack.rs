//! Slack Web API integration (`channel-notify`).

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::catalog::Credentials;
use crate::error::{AdapterError, Result};
use crate::traits::{
    ActionOutput, ActionRequest, Capability, DeliveryReceipt, HealthStatus, Integration,
};

const SLACK_API_BASE: &str = "https://slack.com/api";

const NAME: &str = "slack";

/// Posts messages to a Slack channel with a bot token.
pub struct SlackChannel {
    bot_token: Option<String>,
    default_channel: Option<String>,
    http: reqwest::Client,
}

impl SlackChannel {
    pub fn new(bot_token: Option<String>, default_channel: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("Flowsmith/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            bot_token: bot_token.filter(|t| !t.trim().is_empty()),
            default_channel: default_channel.filter(|c| !c.trim().is_empty()),
            http,
        }
    }

    /// Build from `SLACK_BOT_TOKEN` / `SLACK_CHANNEL_ID`.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self::new(
            credentials.get("SLACK_BOT_TOKEN").map(str::to_owned),
            credentials.get("SLACK_CHANNEL_ID").map(str::to_owned),
        )
    }

    /// Post `text` to `channel` via `chat.postMessage`.
    pub async fn post_message(&self, channel: &str, text: &str) -> Result<DeliveryReceipt> {
        let body = json!({ "channel": channel, "text": text });
        debug!(channel = %channel, "posting Slack message");

        let resp = self.call("chat.postMessage", Some(&body)).await?;
        Ok(DeliveryReceipt {
            integration: NAME.to_string(),
            target: channel.to_string(),
            message_id: resp["ts"].as_str().map(str::to_owned),
        })
    }

    async fn call(&self, method: &str, body: Option<&Value>) -> Result<Value> {
        let token = self
            .bot_token
            .as_deref()
            .ok_or_else(|| AdapterError::MissingCredentials {
                integration: NAME.into(),
                keys: vec!["SLACK_BOT_TOKEN".into()],
            })?;

        let mut req = self
            .http
            .post(format!("{SLACK_API_BASE}/{method}"))
            .bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp: Value = req
            .send()
            .await
            .map_err(|e| failed(format!("{method} request failed: {e}")))?
            .json()
            .await
            .map_err(|e| failed(format!("{method} returned invalid JSON: {e}")))?;

        parse_slack_response(&resp)?;
        Ok(resp)
    }
}

/// Slack answers HTTP 200 with `{"ok": false, "error": "..."}` on failure.
pub fn parse_slack_response(response: &Value) -> Result<()> {
    if response["ok"].as_bool().unwrap_or(false) {
        Ok(())
    } else {
        let error = response["error"].as_str().unwrap_or("unknown_error");
        Err(failed(format!("Slack API error: {error}")))
    }
}

fn failed(reason: String) -> AdapterError {
    AdapterError::ExecutionFailed {
        integration: NAME.into(),
        reason,
    }
}

#[async_trait]
impl Integration for SlackChannel {
    fn name(&self) -> &str {
        NAME
    }

    fn capability(&self) -> Capability {
        Capability::ChannelNotify
    }

    fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.default_channel.is_some()
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if self.bot_token.is_none() {
            return Ok(HealthStatus::Unhealthy);
        }
        Ok(match self.call("auth.test", None).await {
            Ok(_) if self.default_channel.is_some() => HealthStatus::Healthy,
            Ok(_) => HealthStatus::Degraded,
            Err(_) => HealthStatus::Unhealthy,
        })
    }

    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput> {
        let capability = request.capability();
        let ActionRequest::ChannelNotify { channel, text } = request else {
            return Err(AdapterError::Unsupported {
                integration: NAME.into(),
                capability: capability.to_string(),
            });
        };

        let channel = channel
            .or_else(|| self.default_channel.clone())
            .ok_or_else(|| AdapterError::MissingCredentials {
                integration: NAME.into(),
                keys: vec!["SLACK_CHANNEL_ID".into()],
            })?;

        self.post_message(&channel, &text)
            .await
            .map(ActionOutput::Delivered)
    }
}
