//! Telegram Bot API integration (`messaging-bot-send`).
//!
//! Messages are sent with `parse_mode = HTML`, matching the markup produced
//! by the flow message formatter.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::catalog::Credentials;
use crate::error::{AdapterError, Result};
use crate::traits::{
    ActionOutput, ActionRequest, Capability, DeliveryReceipt, HealthStatus, Integration,
};

/// All method calls are POSTed to `{BASE}{bot_token}/{method}`.
const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";

/// Telegram rejects messages longer than this many characters.
const MAX_MESSAGE_CHARS: usize = 4096;

const NAME: &str = "telegram";

/// Sends messages through a Telegram bot.
pub struct TelegramBot {
    bot_token: Option<String>,
    default_chat: Option<String>,
    http: reqwest::Client,
}

impl TelegramBot {
    /// Create a bot client. Either value may be absent; calls then fail
    /// with [`AdapterError::MissingCredentials`] or need an explicit target.
    pub fn new(bot_token: Option<String>, default_chat: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("Flowsmith/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_default();

        Self {
            bot_token: bot_token.filter(|t| !t.trim().is_empty()),
            default_chat: default_chat.filter(|c| !c.trim().is_empty()),
            http,
        }
    }

    /// Build from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        Self::new(
            credentials.get("TELEGRAM_BOT_TOKEN").map(str::to_owned),
            credentials.get("TELEGRAM_CHAT_ID").map(str::to_owned),
        )
    }

    /// Send `text` to `chat_id`.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<DeliveryReceipt> {
        let url = self.api_url("sendMessage")?;
        let body = json!({
            "chat_id": chat_id,
            "text": truncate_chars(text, MAX_MESSAGE_CHARS),
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        debug!(chat_id = %chat_id, "sending Telegram message");

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| failed(format!("failed to send message: {e}")))?;
        let json_resp: Value = response
            .json()
            .await
            .map_err(|e| failed(format!("failed to parse response: {e}")))?;

        parse_telegram_response(&json_resp)?;

        Ok(DeliveryReceipt {
            integration: NAME.to_string(),
            target: chat_id.to_string(),
            message_id: json_resp["result"]["message_id"]
                .as_i64()
                .map(|id| id.to_string()),
        })
    }

    fn api_url(&self, method: &str) -> Result<String> {
        let token = self
            .bot_token
            .as_deref()
            .ok_or_else(|| AdapterError::MissingCredentials {
                integration: NAME.into(),
                keys: vec!["TELEGRAM_BOT_TOKEN".into()],
            })?;
        Ok(format!("{TELEGRAM_API_BASE}{token}/{method}"))
    }
}

/// Check the `ok` flag of a Bot API response.
///
/// Success looks like `{ "ok": true, "result": {...} }`, failure like
/// `{ "ok": false, "error_code": 400, "description": "..." }`.
pub fn parse_telegram_response(response: &Value) -> Result<()> {
    if response.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        return Ok(());
    }

    let error_code = response
        .get("error_code")
        .and_then(Value::as_i64)
        .unwrap_or(-1);
    let description = response
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(failed(format!(
        "Telegram API error (code {error_code}): {description}"
    )))
}

fn failed(reason: String) -> AdapterError {
    AdapterError::ExecutionFailed {
        integration: NAME.into(),
        reason,
    }
}

/// Cut `text` to at most `max` characters on a char boundary.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl Integration for TelegramBot {
    fn name(&self) -> &str {
        NAME
    }

    fn capability(&self) -> Capability {
        Capability::MessagingBotSend
    }

    fn is_configured(&self) -> bool {
        self.bot_token.is_some() && self.default_chat.is_some()
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        let Ok(url) = self.api_url("getMe") else {
            return Ok(HealthStatus::Unhealthy);
        };

        let status = match self.http.get(&url).send().await {
            Ok(resp) => match resp.json::<Value>().await {
                Ok(body) if parse_telegram_response(&body).is_ok() => {
                    if self.default_chat.is_some() {
                        HealthStatus::Healthy
                    } else {
                        HealthStatus::Degraded
                    }
                }
                _ => HealthStatus::Unhealthy,
            },
            Err(e) => {
                warn!(error = %e, "Telegram health check failed");
                HealthStatus::Unhealthy
            }
        };
        Ok(status)
    }

    async fn invoke(&self, request: ActionRequest) -> Result<ActionOutput> {
        let capability = request.capability();
        let ActionRequest::BotMessage { target, text } = request else {
            return Err(AdapterError::Unsupported {
                integration: NAME.into(),
                capability: capability.to_string(),
            });
        };

        let chat_id = target
            .or_else(|| self.default_chat.clone())
            .ok_or_else(|| AdapterError::MissingCredentials {
                integration: NAME.into(),
                keys: vec!["TELEGRAM_CHAT_ID".into()],
            })?;

        self.send_message(&chat_id, &text)
            .await
            .map(ActionOutput::Delivered)
    }
}
