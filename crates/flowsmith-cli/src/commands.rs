//! Subcommand implementations.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use flowsmith_adapters::{CapabilityTable, Credentials};
use flowsmith_engine::{Automation, EngineError, Flow};

use crate::config::AppConfig;
use crate::helpers::{format_unix, open_service, print_report, print_validation};

// ---------------------------------------------------------------------------
// Subcommand: generate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct GenerateOptions {
    pub save: bool,
    pub schedule: Option<i64>,
    pub run: bool,
    pub real: bool,
    pub json: bool,
}

pub async fn generate(config: &AppConfig, prompt: &str, options: GenerateOptions) -> Result<()> {
    let service = open_service(config).await?;

    let generation = match service.generate_flow(prompt).await {
        Ok(generation) => generation,
        Err(EngineError::ValidationRejected { flow, validation }) => {
            println!();
            println!("  Flow rejected: {}", flow.name);
            print_validation(&validation);
            println!();
            anyhow::bail!("generated flow was rejected by validation");
        }
        Err(e) => return Err(e).context("failed to generate flow"),
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&generation.flow)?);
    } else {
        println!();
        println!("  {}", generation.flow.name);
        println!(
            "  Intent:   {} / {} via {}",
            generation.intent.action, generation.intent.complexity, generation.intent.source
        );
        print_validation(&generation.validation);
        print_flow(&generation.flow);
    }

    if options.save {
        let saved = service.save_flow(&generation.flow).await?;
        println!("  Saved as {}", saved.id);
    }

    if let Some(minutes) = options.schedule {
        let automation = service
            .create_automation(generation.flow.clone(), minutes)
            .await
            .context("failed to create automation")?;
        println!(
            "  Automation {} runs every {} min, next at {}",
            automation.id,
            automation.cadence_minutes,
            automation.next_due_at.format("%Y-%m-%d %H:%M UTC")
        );
    }

    if options.run {
        let report = service.execute_flow(&generation.flow, options.real).await;
        print_report(&report);
    }
    println!();
    Ok(())
}

fn print_flow(flow: &Flow) {
    println!();
    for node in &flow.nodes {
        let integration = node
            .integration()
            .map(|name| format!(" [{name}]"))
            .unwrap_or_default();
        println!("    {:<16} {:<11} {}{integration}", node.id, node.kind, node.label);
    }
    for edge in &flow.edges {
        let branch = edge
            .branch
            .as_deref()
            .map(|b| format!(" ({b})"))
            .unwrap_or_default();
        let back = if edge.is_loop_back { " [loop back]" } else { "" };
        println!("    {} -> {}{branch}{back}", edge.from, edge.to);
    }
}

// ---------------------------------------------------------------------------
// Subcommand: execute / flows
// ---------------------------------------------------------------------------

pub async fn execute(config: &AppConfig, id: &str, real: bool) -> Result<()> {
    let service = open_service(config).await?;
    let report = service
        .execute_saved_flow(id, real)
        .await
        .with_context(|| format!("failed to execute flow {id}"))?;
    print_report(&report);
    Ok(())
}

pub async fn flows_list(config: &AppConfig, limit: usize, offset: usize) -> Result<()> {
    let service = open_service(config).await?;
    let flows = service.list_saved_flows(limit, offset).await?;
    if flows.is_empty() {
        println!("  No saved flows.");
        return Ok(());
    }
    println!();
    for flow in flows {
        println!(
            "  {}  {:<32} score {:>3}  runs {:>3}  last {}",
            flow.id,
            flow.name,
            flow.validation_score.map_or("-".to_string(), |s| s.to_string()),
            flow.execution_count,
            format_unix(flow.last_executed_at),
        );
    }
    println!();
    Ok(())
}

pub async fn flows_show(config: &AppConfig, id: &str) -> Result<()> {
    let service = open_service(config).await?;
    let saved = service.get_saved_flow(id).await?;
    println!("{}", serde_json::to_string_pretty(&saved)?);
    Ok(())
}

pub async fn flows_remove(config: &AppConfig, id: &str) -> Result<()> {
    let service = open_service(config).await?;
    service.remove_saved_flow(id).await?;
    println!("  Removed flow {id}");
    Ok(())
}

pub async fn flows_schedule(config: &AppConfig, id: &str, every: i64) -> Result<()> {
    let service = open_service(config).await?;
    let automation = service
        .schedule_saved_flow(id, every)
        .await
        .with_context(|| format!("failed to schedule flow {id}"))?;
    print_automation(&automation);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: automations
// ---------------------------------------------------------------------------

fn print_automation(automation: &Automation) {
    println!(
        "  {}  {:<32} every {:>4} min  {:<8} next {}  last {} ({})  runs {}",
        automation.id,
        automation.name,
        automation.cadence_minutes,
        if automation.enabled { "enabled" } else { "stopped" },
        automation.next_due_at.format("%Y-%m-%d %H:%M"),
        automation
            .last_run_at
            .map_or("-".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string()),
        automation.last_outcome_label(),
        automation.run_count,
    );
}

pub async fn automations_list(config: &AppConfig) -> Result<()> {
    let service = open_service(config).await?;
    let automations = service.list_automations().await?;
    if automations.is_empty() {
        println!("  No automations.");
        return Ok(());
    }
    println!();
    for automation in &automations {
        print_automation(automation);
    }
    println!();
    Ok(())
}

pub async fn automations_show(config: &AppConfig, id: &str) -> Result<()> {
    let service = open_service(config).await?;
    let automation = service.get_automation(id).await?;
    println!("{}", serde_json::to_string_pretty(&automation)?);
    Ok(())
}

pub async fn automations_toggle(config: &AppConfig, id: &str, enable: bool) -> Result<()> {
    let service = open_service(config).await?;
    let automation = if enable {
        service.start_automation(id).await?
    } else {
        service.stop_automation(id).await?
    };
    print_automation(&automation);
    Ok(())
}

pub async fn automations_run(config: &AppConfig, id: &str) -> Result<()> {
    let service = open_service(config).await?;
    let report = service
        .run_automation_now(id)
        .await
        .with_context(|| format!("failed to run automation {id}"))?;
    print_report(&report);
    Ok(())
}

pub async fn automations_remove(config: &AppConfig, id: &str) -> Result<()> {
    let service = open_service(config).await?;
    service.remove_automation(id).await?;
    println!("  Removed automation {id}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

pub async fn serve(config: &AppConfig) -> Result<()> {
    let service = open_service(config).await?;
    let mut scheduler = service.scheduler();
    scheduler
        .start()
        .await
        .context("failed to start scheduler")?;

    let (total, enabled) = {
        let stats = service.stats().await?;
        (stats.automations, stats.enabled_automations)
    };
    info!(total, enabled, "serving automations, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!(in_flight = scheduler.in_flight(), "shutting down");
    scheduler.stop().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: reporting
// ---------------------------------------------------------------------------

pub async fn stats(config: &AppConfig) -> Result<()> {
    let service = open_service(config).await?;
    let stats = service.stats().await?;
    let learning = &stats.learning;

    println!();
    println!("  Flowsmith Stats");
    println!("  ===============");
    println!();
    println!("  Generations:       {}", learning.total);
    println!("    accepted:        {}", learning.accepted);
    println!("    with warnings:   {}", learning.accepted_with_warnings);
    println!("    rejected:        {}", learning.rejected);
    println!("    errored:         {}", learning.errored);
    match stats.success_rate {
        Some(rate) => println!("  Success rate:      {:.1}%", rate * 100.0),
        None => println!("  Success rate:      -"),
    }
    match learning.average_score {
        Some(avg) => println!("  Average score:     {avg:.1}"),
        None => println!("  Average score:     -"),
    }
    println!("  Saved flows:       {}", stats.saved_flows);
    println!(
        "  Automations:       {} ({} enabled)",
        stats.automations, stats.enabled_automations
    );
    println!();
    Ok(())
}

pub async fn history(config: &AppConfig, limit: usize) -> Result<()> {
    let service = open_service(config).await?;
    let records = service.history(limit).await?;
    if records.is_empty() {
        println!("  No generations recorded yet.");
        return Ok(());
    }
    println!();
    for record in records {
        let result = match (&record.error, &record.verdict) {
            (Some(error), _) => format!("error: {error}"),
            (None, Some(verdict)) => format!(
                "{verdict} ({})",
                record.score.map_or("-".to_string(), |s| s.to_string())
            ),
            (None, None) => "-".into(),
        };
        println!(
            "  {}  {:<48}  {result}",
            format_unix(Some(record.recorded_at)),
            record.prompt
        );
    }
    println!();
    Ok(())
}

pub async fn integrations(config: &AppConfig, check: bool) -> Result<()> {
    let service = open_service(config).await?;
    let statuses = service.list_integrations();
    let table = if check {
        Some(CapabilityTable::from_credentials(&Credentials::from_env())?)
    } else {
        None
    };

    println!();
    for status in statuses {
        let state = if status.configured {
            "configured".to_string()
        } else {
            format!("missing {}", status.missing_keys.join(", "))
        };
        println!("  {:<10} {:<42} {state}", status.name, status.display_name);

        if let Some(table) = &table
            && status.configured
            && let Some(integration) = table.get(status.name)
        {
            match integration.health_check().await {
                Ok(health) => println!("             health: {health}"),
                Err(e) => println!("             health: unhealthy ({e})"),
            }
        }
        if !status.configured {
            println!("             see {}", status.docs_url);
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

pub async fn status(config: &AppConfig, config_path: &Path) -> Result<()> {
    println!();
    println!("  Flowsmith Status");
    println!("  ================");
    println!();

    if config_path.exists() {
        println!("  Config:           OK ({})", config_path.display());
    } else {
        println!("  Config:           defaults ({} not found)", config_path.display());
    }

    let db_path = &config.storage.database_path;
    if db_path.exists() {
        println!("  Database:         OK ({})", db_path.display());
    } else {
        println!("  Database:         NOT INITIALIZED ({})", db_path.display());
    }
    println!("  Output dir:       {}", config.storage.output_dir.display());

    let credentials = Credentials::from_env();
    let model_key = ["ANTHROPIC_API_KEY", "OPENAI_API_KEY", "GEMINI_API_KEY"]
        .into_iter()
        .find(|key| credentials.get(key).is_some());
    match (config.llm.provider.as_str(), model_key) {
        ("none", _) => println!("  Language model:   disabled"),
        (_, Some(key)) => println!("  Language model:   CONFIGURED ({key})"),
        (_, None) => println!("  Language model:   NOT SET (keyword interpretation only)"),
    }

    let configured = flowsmith_adapters::catalog::statuses(&credentials)
        .into_iter()
        .filter(|s| s.configured)
        .map(|s| s.name)
        .collect::<Vec<_>>();
    println!("  Integrations:     {}", configured.join(", "));

    if db_path.exists() {
        let service = open_service(config).await?;
        let stats = service.stats().await?;
        println!(
            "  Automations:      {} ({} enabled)",
            stats.automations, stats.enabled_automations
        );
    }
    println!();
    Ok(())
}
