//! Shared helpers for the CLI subcommands.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowsmith_adapters::{CapabilityTable, Credentials};
use flowsmith_engine::{
    ExecutionReport, FlowService, IntentInterpreter, LlmIntentModel, NodeStatus, SystemClock,
    ValidationResult,
};
use flowsmith_llm::{LlmClient, LlmClientConfig};
use flowsmith_store::Database;

use crate::config::{AppConfig, LlmSettings};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// Open the database and assemble the service with live integrations.
pub async fn open_service(config: &AppConfig) -> Result<FlowService> {
    let db_path = config.storage.database_path.clone();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let db = Database::open_and_migrate(db_path.clone())
        .await
        .context("failed to open database")?;
    info!(path = %db_path.display(), "store initialized");

    let credentials = Credentials::from_env();
    let table =
        CapabilityTable::from_credentials(&credentials).context("failed to set up integrations")?;
    let interpreter = build_interpreter(config, &credentials);

    Ok(FlowService::new(
        db,
        table,
        credentials,
        config.engine.clone(),
        Arc::new(SystemClock),
    )
    .with_interpreter(interpreter))
}

/// Pick the model provider from `[llm]` and the available API keys.
/// Without a usable key, interpretation is keyword-only.
pub fn build_interpreter(config: &AppConfig, credentials: &Credentials) -> IntentInterpreter {
    let settings = &config.llm;
    let timeout = config.engine.interpreter.model_timeout();
    let Some(client_config) = client_config(settings, credentials) else {
        info!("no language model configured, using keyword interpretation");
        return IntentInterpreter::keywords_only();
    };

    match LlmClient::new(client_config) {
        Ok(client) => {
            info!(model = client.default_model(), "language model interpretation enabled");
            let model = LlmIntentModel::new(Arc::new(client), settings.model.clone());
            IntentInterpreter::with_model(Arc::new(model), timeout)
        }
        Err(e) => {
            warn!(error = %e, "language model unavailable, using keyword interpretation");
            IntentInterpreter::keywords_only()
        }
    }
}

fn client_config(settings: &LlmSettings, credentials: &Credentials) -> Option<LlmClientConfig> {
    let key = |name: &str| credentials.get(name).map(str::to_string);
    let model = |default: &str| {
        if settings.model.is_empty() {
            default.to_string()
        } else {
            settings.model.clone()
        }
    };

    let provider = match settings.provider.as_str() {
        "auto" => ["anthropic", "openai", "gemini"]
            .into_iter()
            .find(|p| key(api_key_name(p)).is_some())?,
        "none" => return None,
        other => other,
    };

    let api_key = key(api_key_name(provider))?;
    let config = match provider {
        "anthropic" => LlmClientConfig::anthropic(api_key, model("claude-3-5-haiku-latest")),
        "gemini" => LlmClientConfig::gemini(api_key, model("gemini-2.0-flash")),
        "openai" if !settings.base_url.is_empty() => {
            LlmClientConfig::openai_compatible(api_key, model("gpt-4o-mini"), &settings.base_url)
        }
        "openai" => LlmClientConfig::openai(api_key, model("gpt-4o-mini")),
        unknown => {
            warn!(provider = unknown, "unknown llm provider");
            return None;
        }
    };
    Some(config)
}

fn api_key_name(provider: &str) -> &'static str {
    match provider {
        "openai" => "OPENAI_API_KEY",
        "gemini" => "GEMINI_API_KEY",
        _ => "ANTHROPIC_API_KEY",
    }
}

// ---------------------------------------------------------------------------
// Printing
// ---------------------------------------------------------------------------

pub fn print_validation(validation: &ValidationResult) {
    println!("  Score:    {}/100 ({})", validation.score, validation.verdict);
    for warning in &validation.warnings {
        println!("  warning:  {warning}");
    }
    for error in &validation.errors {
        println!("  error:    {error}");
    }
}

pub fn print_report(report: &ExecutionReport) {
    println!();
    println!(
        "  {} [{}] {} ({} ms)",
        report.flow_name,
        report.mode,
        report.outcome,
        (report.finished_at - report.started_at).num_milliseconds()
    );
    for node in &report.nodes {
        let marker = match node.status {
            NodeStatus::Succeeded => "ok  ",
            NodeStatus::Skipped => "skip",
            NodeStatus::Failed => "FAIL",
        };
        match &node.error {
            Some(error) => println!("    {marker} {:<16} {error}", node.node_id),
            None => println!("    {marker} {:<16} {}", node.node_id, node.kind),
        }
    }
    for artifact in report.artifacts() {
        println!("  wrote {}", artifact.display());
    }
    if let Some(text) = report.output_text().filter(|t| !t.is_empty()) {
        println!();
        println!("{text}");
    }
    println!();
}

pub fn format_unix(secs: Option<i64>) -> String {
    secs.and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".into())
}
