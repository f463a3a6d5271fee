//! Integration tests for the flowsmith-adapters crate.
//!
//! These tests exercise the capability table built from credentials and
//! the behavior of unconfigured integrations. Nothing here reaches the
//! network: every call fails before a request is sent.

use flowsmith_adapters::{
    ActionRequest, AdapterError, CapabilityTable, Credentials, HealthStatus, SmtpMailer,
    catalog,
};

// ═══════════════════════════════════════════════════════════════════════
//  Capability table
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn table_from_empty_credentials_registers_every_integration() {
    let table = CapabilityTable::from_credentials(&Credentials::default()).unwrap();

    assert_eq!(table.names(), vec!["email", "quote", "slack", "telegram"]);
    for name in table.names() {
        let integration = table.get(&name).unwrap();
        assert_eq!(integration.name(), name);
        assert_eq!(
            Some(integration.capability()),
            catalog::spec(&name).map(|s| s.capability)
        );
        // Only the keyless quote feed is usable without credentials.
        assert_eq!(integration.is_configured(), name == "quote", "{name}");
    }
}

#[tokio::test]
async fn unregistered_name_is_reported() {
    let table = CapabilityTable::new();
    let err = table
        .invoke(
            "whatsapp",
            ActionRequest::ChannelNotify {
                channel: None,
                text: "hi".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::NotRegistered { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn mismatched_request_is_unsupported() {
    let table = CapabilityTable::from_credentials(&Credentials::default()).unwrap();
    let err = table
        .invoke(
            "slack",
            ActionRequest::Email {
                to: None,
                subject: "s".into(),
                body: "b".into(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Unsupported { .. }), "{err}");
}

// ═══════════════════════════════════════════════════════════════════════
//  Unconfigured integrations
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unconfigured_messaging_fails_without_retry() {
    let table = CapabilityTable::from_credentials(&Credentials::default()).unwrap();

    let err = table
        .invoke(
            "telegram",
            ActionRequest::BotMessage {
                target: Some("42".into()),
                text: "hi".into(),
            },
        )
        .await
        .unwrap_err();

    match &err {
        AdapterError::MissingCredentials { integration, keys } => {
            assert_eq!(integration, "telegram");
            assert_eq!(keys, &vec!["TELEGRAM_BOT_TOKEN".to_string()]);
        }
        other => panic!("expected missing credentials, got {other}"),
    }
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unconfigured_health_checks_are_unhealthy() {
    let table = CapabilityTable::from_credentials(&Credentials::default()).unwrap();
    for name in ["telegram", "slack", "email"] {
        let health = table.get(name).unwrap().health_check().await.unwrap();
        assert_eq!(health, HealthStatus::Unhealthy, "{name}");
    }
}

#[test]
fn bad_smtp_port_is_a_config_error() {
    let creds = Credentials::from_pairs([
        ("SMTP_SERVER", "smtp.example.com"),
        ("SMTP_USER", "me@example.com"),
        ("SMTP_PASSWORD", "secret"),
        ("SMTP_PORT", "not-a-port"),
    ]);
    assert!(matches!(
        SmtpMailer::from_credentials(&creds),
        Err(AdapterError::Config(_))
    ));
    assert!(CapabilityTable::from_credentials(&creds).is_err());
}

#[test]
fn statuses_report_missing_keys_and_docs() {
    let creds = Credentials::from_pairs([("TELEGRAM_BOT_TOKEN", "123:abc")]);
    let statuses = catalog::statuses(&creds);

    let telegram = statuses.iter().find(|s| s.name == "telegram").unwrap();
    assert!(!telegram.configured);
    assert_eq!(telegram.missing_keys, vec!["TELEGRAM_CHAT_ID"]);
    assert!(telegram.docs_url.starts_with("https://"));

    let quote = statuses.iter().find(|s| s.name == "quote").unwrap();
    assert!(quote.configured);
    assert!(quote.missing_keys.is_empty());
}
