//! Integration catalog and credential lookup.
//!
//! The catalog is the recognized capability set: a flow may only name
//! integrations listed here. Each entry also records which credential keys
//! the integration needs so callers can report what is missing before
//! anything is scheduled.

use std::collections::HashMap;

use serde::Serialize;

use crate::traits::Capability;

/// Static description of one integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IntegrationSpec {
    pub name: &'static str,
    pub display_name: &'static str,
    pub capability: Capability,
    /// Environment keys that must be set for the integration to work.
    pub credential_keys: &'static [&'static str],
    pub docs_url: &'static str,
    pub note: Option<&'static str>,
}

/// Every integration Flowsmith knows how to drive.
pub static CATALOG: &[IntegrationSpec] = &[
    IntegrationSpec {
        name: "telegram",
        display_name: "Telegram Bot",
        capability: Capability::MessagingBotSend,
        credential_keys: &["TELEGRAM_BOT_TOKEN", "TELEGRAM_CHAT_ID"],
        docs_url: "https://core.telegram.org/bots/api",
        note: None,
    },
    IntegrationSpec {
        name: "quote",
        display_name: "Currency quotes (BCB PTAX / AwesomeAPI)",
        capability: Capability::QuoteFetch,
        credential_keys: &[],
        docs_url: "https://docs.awesomeapi.com.br/api-de-moedas",
        note: Some("free public APIs, no authentication required"),
    },
    IntegrationSpec {
        name: "email",
        display_name: "Email (SMTP over TLS)",
        capability: Capability::EmailSend,
        credential_keys: &["SMTP_SERVER", "SMTP_USER", "SMTP_PASSWORD"],
        docs_url: "https://support.google.com/mail/answer/7126229",
        note: Some("implicit TLS only; SMTP_PORT defaults to 465"),
    },
    IntegrationSpec {
        name: "slack",
        display_name: "Slack",
        capability: Capability::ChannelNotify,
        credential_keys: &["SLACK_BOT_TOKEN", "SLACK_CHANNEL_ID"],
        docs_url: "https://api.slack.com/tutorials/tracks/getting-a-token",
        note: None,
    },
];

/// Optional keys read alongside the catalog's required ones. The model keys
/// are not integrations but travel in the same snapshot.
const OPTIONAL_KEYS: &[&str] = &[
    "SMTP_PORT",
    "EMAIL_TO",
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
];

/// Look up a catalog entry by name (case-insensitive).
pub fn spec(name: &str) -> Option<&'static IntegrationSpec> {
    CATALOG
        .iter()
        .find(|spec| spec.name.eq_ignore_ascii_case(name))
}

/// Whether `name` is in the recognized capability set.
pub fn is_known(name: &str) -> bool {
    spec(name).is_some()
}

/// Names of all recognized integrations, in catalog order.
pub fn known_names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|spec| spec.name)
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// A snapshot of integration credentials.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    values: HashMap<String, String>,
}

impl Credentials {
    /// Read every catalog key (plus optional extras) from the environment.
    pub fn from_env() -> Self {
        let keys = CATALOG
            .iter()
            .flat_map(|spec| spec.credential_keys.iter())
            .chain(OPTIONAL_KEYS.iter());
        Self::from_pairs(keys.filter_map(|key| {
            std::env::var(key).ok().map(|value| (key.to_string(), value))
        }))
    }

    /// Build from explicit key/value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// A non-blank value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Required keys of `integration` that have no value. Unknown
    /// integrations report nothing missing.
    pub fn missing(&self, integration: &str) -> Vec<&'static str> {
        spec(integration)
            .map(|spec| {
                spec.credential_keys
                    .iter()
                    .copied()
                    .filter(|key| self.get(key).is_none())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Catalog entry plus its current credential status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationStatus {
    pub name: &'static str,
    pub display_name: &'static str,
    pub capability: Capability,
    pub configured: bool,
    pub missing_keys: Vec<&'static str>,
    pub docs_url: &'static str,
    pub note: Option<&'static str>,
}

/// Report the status of every catalog entry.
pub fn statuses(credentials: &Credentials) -> Vec<IntegrationStatus> {
    CATALOG
        .iter()
        .map(|spec| {
            let missing_keys = credentials.missing(spec.name);
            IntegrationStatus {
                name: spec.name,
                display_name: spec.display_name,
                capability: spec.capability,
                configured: missing_keys.is_empty(),
                missing_keys,
                docs_url: spec.docs_url,
                note: spec.note,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_names_are_unique() {
        let mut names: Vec<_> = known_names().collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CATALOG.len());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert!(is_known("Telegram"));
        assert!(!is_known("whatsapp"));
        assert_eq!(spec("QUOTE").map(|s| s.capability), Some(Capability::QuoteFetch));
    }

    #[test]
    fn blank_values_count_as_missing() {
        let creds = Credentials::from_pairs([
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "   "),
        ]);
        assert_eq!(creds.missing("telegram"), vec!["TELEGRAM_CHAT_ID"]);
        assert!(creds.missing("quote").is_empty());
        assert!(creds.missing("unknown").is_empty());
    }

    #[test]
    fn statuses_cover_whole_catalog() {
        let creds = Credentials::from_pairs([
            ("SLACK_BOT_TOKEN", "xoxb-1"),
            ("SLACK_CHANNEL_ID", "C123"),
        ]);
        let statuses = statuses(&creds);
        assert_eq!(statuses.len(), CATALOG.len());

        let slack = statuses.iter().find(|s| s.name == "slack").unwrap();
        assert!(slack.configured);
        let email = statuses.iter().find(|s| s.name == "email").unwrap();
        assert!(!email.configured);
        assert_eq!(email.missing_keys.len(), 3);
    }
}
