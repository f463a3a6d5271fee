//! Engine tunables.
//!
//! Each section deserializes from the matching `config/default.toml` table
//! and falls back to its documented default for any missing key.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::validator::ValidationPolicy;

/// Everything the engine needs besides storage and integrations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub validation: ValidationPolicy,
    pub executor: ExecutorConfig,
    pub scheduler: SchedulerConfig,
    pub interpreter: InterpreterConfig,
}

/// `[executor]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Hard ceiling on loop iterations, whatever the node asks for.
    pub max_loop_iterations: u32,
    /// Per-call timeout for integration invocations.
    pub integration_timeout_secs: u64,
    /// Extra attempts after a retryable integration failure.
    pub integration_retries: u32,
    /// Where `file` outputs and `database` nodes write.
    pub output_dir: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_loop_iterations: 10,
            integration_timeout_secs: 30,
            integration_retries: 1,
            output_dir: PathBuf::from("data/output"),
        }
    }
}

impl ExecutorConfig {
    pub fn integration_timeout(&self) -> Duration {
        Duration::from_secs(self.integration_timeout_secs.max(1))
    }
}

/// `[scheduler]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// `[interpreter]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// How long to wait for the model before using keyword classification.
    pub model_timeout_secs: u64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            model_timeout_secs: 20,
        }
    }
}

impl InterpreterConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs.max(1))
    }
}
