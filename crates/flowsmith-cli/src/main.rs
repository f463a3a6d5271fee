//! CLI entry point for Flowsmith.
//!
//! This binary provides the `flowsmith` command: generate flows from plain
//! language, run them once, manage saved flows and automations, and serve
//! the automation scheduler.

mod commands;
mod config;
mod helpers;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{AppConfig, DEFAULT_CONFIG_PATH};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Flowsmith: automation flows from plain language.
#[derive(Parser)]
#[command(
    name = "flowsmith",
    version,
    about = "Flowsmith: automation flows from plain language",
    long_about = "Turns a plain-language request into a validated automation flow, \
                  runs it once or on a fixed cadence, and records every generation."
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a flow from a plain-language prompt.
    Generate {
        /// The request, e.g. "send me the dollar quote every morning".
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
        /// Save the flow for later use.
        #[arg(long)]
        save: bool,
        /// Create an automation running every N minutes.
        #[arg(long, value_name = "MINUTES")]
        schedule: Option<i64>,
        /// Run the flow once right away (dry-run unless --real).
        #[arg(long)]
        run: bool,
        /// Perform real side effects when running.
        #[arg(long, requires = "run")]
        real: bool,
        /// Print the flow as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run a saved flow once.
    Execute {
        id: String,
        /// Perform real side effects instead of a dry run.
        #[arg(long)]
        real: bool,
    },

    /// Manage saved flows.
    #[command(subcommand)]
    Flows(FlowCommand),

    /// Manage automations.
    #[command(subcommand)]
    Automations(AutomationCommand),

    /// Run the automation scheduler until interrupted.
    Serve,

    /// Show generation and automation counters.
    Stats,

    /// Show recent generation attempts.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// List integrations and their credential status.
    Integrations {
        /// Also run a health check against each configured service.
        #[arg(long)]
        check: bool,
    },

    /// Show current system status.
    Status,
}

#[derive(Subcommand)]
enum FlowCommand {
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    Show {
        id: String,
    },
    Remove {
        id: String,
    },
    /// Turn a saved flow into an automation.
    Schedule {
        id: String,
        #[arg(long, value_name = "MINUTES")]
        every: i64,
    },
}

#[derive(Subcommand)]
enum AutomationCommand {
    List,
    Show { id: String },
    Start { id: String },
    Stop { id: String },
    /// Run now, whether enabled or not.
    Run { id: String },
    Remove { id: String },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine: credentials may come from the real environment.
    let _ = dotenvy::dotenv();

    helpers::init_tracing(match cli.command {
        Commands::Serve => "info",
        _ => "warn",
    });
    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Generate {
            prompt,
            save,
            schedule,
            run,
            real,
            json,
        } => {
            let options = commands::GenerateOptions {
                save,
                schedule,
                run,
                real,
                json,
            };
            commands::generate(&config, &prompt.join(" "), options).await
        }
        Commands::Execute { id, real } => commands::execute(&config, &id, real).await,
        Commands::Flows(cmd) => match cmd {
            FlowCommand::List { limit, offset } => commands::flows_list(&config, limit, offset).await,
            FlowCommand::Show { id } => commands::flows_show(&config, &id).await,
            FlowCommand::Remove { id } => commands::flows_remove(&config, &id).await,
            FlowCommand::Schedule { id, every } => commands::flows_schedule(&config, &id, every).await,
        },
        Commands::Automations(cmd) => match cmd {
            AutomationCommand::List => commands::automations_list(&config).await,
            AutomationCommand::Show { id } => commands::automations_show(&config, &id).await,
            AutomationCommand::Start { id } => commands::automations_toggle(&config, &id, true).await,
            AutomationCommand::Stop { id } => commands::automations_toggle(&config, &id, false).await,
            AutomationCommand::Run { id } => commands::automations_run(&config, &id).await,
            AutomationCommand::Remove { id } => commands::automations_remove(&config, &id).await,
        },
        Commands::Serve => commands::serve(&config).await,
        Commands::Stats => commands::stats(&config).await,
        Commands::History { limit } => commands::history(&config, limit).await,
        Commands::Integrations { check } => commands::integrations(&config, check).await,
        Commands::Status => commands::status(&config, &cli.config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn generate_joins_prompt_words() {
        let cli = Cli::try_parse_from([
            "flowsmith", "generate", "send", "the", "dollar", "--schedule", "60",
        ])
        .unwrap();
        match cli.command {
            Commands::Generate {
                prompt, schedule, ..
            } => {
                assert_eq!(prompt.join(" "), "send the dollar");
                assert_eq!(schedule, Some(60));
            }
            _ => panic!("expected generate"),
        }
    }

    #[test]
    fn real_requires_run() {
        assert!(Cli::try_parse_from(["flowsmith", "generate", "x", "--real"]).is_err());
        assert!(Cli::try_parse_from(["flowsmith", "generate", "x", "--run", "--real"]).is_ok());
    }
}
