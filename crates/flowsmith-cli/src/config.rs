//! Application configuration.
//!
//! Reads `config/default.toml`. A missing file, section or key falls back
//! to the documented default; a file that exists but does not parse is an
//! error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowsmith_engine::EngineConfig;

/// Default location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// `[storage]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Where `file` outputs and `database` nodes write.
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/flowsmith.db"),
            output_dir: PathBuf::from("data/output"),
        }
    }
}

/// `[llm]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    /// `auto`, `anthropic`, `openai`, `gemini` or `none`.
    pub provider: String,
    /// Empty means the provider's default model.
    pub model: String,
    /// Overrides the endpoint for OpenAI-compatible servers.
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "auto".into(),
            model: String::new(),
            base_url: String::new(),
            timeout_secs: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub llm: LlmSettings,
    #[serde(flatten)]
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default().normalized());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Self::parse(&content).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config.normalized())
    }

    /// `[storage] output_dir` is authoritative for the executor.
    fn normalized(mut self) -> Self {
        self.engine.executor.output_dir = self.storage.output_dir.clone();
        if self.llm.timeout_secs > 0 {
            self.engine.interpreter.model_timeout_secs = self.llm.timeout_secs;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config.storage.database_path, PathBuf::from("data/flowsmith.db"));
        assert_eq!(config.engine.validation.accept_threshold, 70);
        assert_eq!(config.engine.executor.max_loop_iterations, 10);
        assert_eq!(config.engine.executor.output_dir, PathBuf::from("data/output"));
        assert_eq!(config.llm.provider, "auto");
    }

    #[test]
    fn sections_override_defaults() {
        let config = AppConfig::parse(
            r#"
            [storage]
            output_dir = "/tmp/out"

            [validation]
            accept_threshold = 80

            [executor]
            max_loop_iterations = 4

            [scheduler]
            poll_interval_secs = 30

            [llm]
            provider = "none"
            timeout_secs = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.engine.validation.accept_threshold, 80);
        assert_eq!(config.engine.validation.reject_floor, 30);
        assert_eq!(config.engine.executor.max_loop_iterations, 4);
        assert_eq!(config.engine.executor.output_dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.engine.scheduler.poll_interval_secs, 30);
        assert_eq!(config.engine.interpreter.model_timeout_secs, 7);
        assert_eq!(config.llm.provider, "none");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, AppConfig::default().normalized());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[executor\nmax_loop_iterations = ").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}
