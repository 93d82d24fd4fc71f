//! Configuration for lessonforge.
//!
//! Settings live in `.lessonforge/lessonforge.toml`:
//!
//! ```toml
//! [engine]
//! workers = 5
//! task_timeout_secs = 120
//! max_fragment_chars = 1200
//! retain_finished_runs = 128
//!
//! [engine.retry]
//! max_attempts = 3
//! base_delay_ms = 500
//! max_delay_ms = 10000
//!
//! [server]
//! port = 3150
//! db_path = ".lessonforge/content.db"
//!
//! [generator]
//! endpoint = "http://127.0.0.1:8089/generate"
//! api_key_env = "LESSONFORGE_GENERATOR_KEY"
//!
//! [logging]
//! level = "info"
//! format = "text"
//! # file = ".lessonforge/logs"
//! ```
//!
//! Layering: file → environment (`LESSONFORGE_WORKERS`,
//! `LESSONFORGE_GENERATOR_ENDPOINT`) → CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{DispatcherConfig, RetryPolicy};

pub const CONFIG_DIR: &str = ".lessonforge";
pub const CONFIG_FILE: &str = "lessonforge.toml";

pub const ENV_WORKERS: &str = "LESSONFORGE_WORKERS";
pub const ENV_GENERATOR_ENDPOINT: &str = "LESSONFORGE_GENERATOR_ENDPOINT";

/// Retry budget for retryable task failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Dispatcher and worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSection {
    /// Worker pool size (fixed for the process lifetime)
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Upper bound on a single generation call
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    /// Maximum characters per theory fragment
    #[serde(default = "default_max_fragment_chars")]
    pub max_fragment_chars: usize,
    /// Finished runs kept pollable
    #[serde(default = "default_retain_finished_runs")]
    pub retain_finished_runs: usize,
    #[serde(default)]
    pub retry: RetrySection,
}

fn default_workers() -> usize {
    5
}

fn default_task_timeout_secs() -> u64 {
    120
}

fn default_max_fragment_chars() -> usize {
    1200
}

fn default_retain_finished_runs() -> usize {
    128
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            task_timeout_secs: default_task_timeout_secs(),
            max_fragment_chars: default_max_fragment_chars(),
            retain_finished_runs: default_retain_finished_runs(),
            retry: RetrySection::default(),
        }
    }
}

impl EngineSection {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.workers.max(1),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            max_fragment_chars: self.max_fragment_chars,
            retry: self.retry.policy(),
            retain_finished_runs: self.retain_finished_runs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    /// libSQL database file, or `:memory:`
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_port() -> u16 {
    3150
}

fn default_db_path() -> String {
    format!("{}/content.db", CONFIG_DIR)
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
        }
    }
}

/// Where the external generation capability lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorSection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Name of the environment variable holding the bearer token
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8089/generate".to_string()
}

fn default_api_key_env() -> String {
    "LESSONFORGE_GENERATOR_KEY".to_string()
}

impl Default for GeneratorSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl GeneratorSection {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for daily-rolling log files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// Parsed `lessonforge.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LessonforgeToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl LessonforgeToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse lessonforge.toml")
    }

    /// Load `lessonforge.toml` from `config_dir`, or defaults if absent.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content =
            toml::to_string_pretty(self).context("Failed to serialize lessonforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut warnings = Vec::new();
        if let Some(raw) = lookup(ENV_WORKERS) {
            match raw.trim().parse::<usize>() {
                Ok(workers) => self.engine.workers = workers,
                Err(_) => warnings.push(format!("Ignoring {}='{}': not a number", ENV_WORKERS, raw)),
            }
        }
        if let Some(endpoint) = lookup(ENV_GENERATOR_ENDPOINT).filter(|e| !e.trim().is_empty()) {
            self.generator.endpoint = endpoint;
        }
        warnings
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.engine.workers == 0 {
            warnings.push("engine.workers is 0; one worker will be used".to_string());
        }
        if self.engine.retry.max_attempts == 0 {
            warnings.push("engine.retry.max_attempts is 0; tasks get one attempt".to_string());
        }
        if self.engine.retry.base_delay_ms > self.engine.retry.max_delay_ms {
            warnings.push(format!(
                "engine.retry.base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.engine.retry.base_delay_ms, self.engine.retry.max_delay_ms
            ));
        }
        if self.engine.max_fragment_chars == 0 {
            warnings.push(
                "engine.max_fragment_chars is 0; every paragraph becomes its own slide"
                    .to_string(),
            );
        }
        if self.engine.retain_finished_runs == 0 {
            warnings.push(
                "engine.retain_finished_runs is 0; finished runs cannot be polled".to_string(),
            );
        }
        if self.generator.endpoint.trim().is_empty() {
            warnings.push("generator.endpoint is empty".to_string());
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            warnings.push(format!(
                "Unknown logging.format '{}': expected 'text' or 'json'",
                self.logging.format
            ));
        }

        warnings
    }
}

/// Resolved configuration: file, then environment, then CLI flags.
#[derive(Debug, Clone)]
pub struct LessonforgeConfig {
    /// File the settings were read from, if any
    pub source: Option<PathBuf>,
    pub toml: LessonforgeToml,
    /// Warnings raised while applying overrides
    pub override_warnings: Vec<String>,
}

impl LessonforgeConfig {
    /// Resolve configuration for `project_dir`.
    ///
    /// An explicit path must exist. Otherwise the project's
    /// `.lessonforge/lessonforge.toml` is used, then the user config
    /// directory, then built-in defaults.
    pub fn load(project_dir: &Path, explicit: Option<&Path>) -> Result<Self> {
        let source = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::candidate_paths(project_dir)
                .into_iter()
                .find(|p| p.exists()),
        };
        let mut toml = match &source {
            Some(path) => LessonforgeToml::load(path)?,
            None => LessonforgeToml::default(),
        };
        let override_warnings = toml.apply_env(|key| std::env::var(key).ok());

        Ok(Self {
            source,
            toml,
            override_warnings,
        })
    }

    fn candidate_paths(project_dir: &Path) -> Vec<PathBuf> {
        let mut paths = vec![project_dir.join(CONFIG_DIR).join(CONFIG_FILE)];
        if let Some(user_dir) = dirs::config_dir() {
            paths.push(user_dir.join("lessonforge").join(CONFIG_FILE));
        }
        paths
    }

    /// Default location for `config init`.
    pub fn project_config_path(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.toml.server.port = port;
        }
        self
    }

    pub fn with_db_path(mut self, db_path: Option<String>) -> Self {
        if let Some(db_path) = db_path {
            self.toml.server.db_path = db_path;
        }
        self
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        self.toml.engine.dispatcher_config()
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = self.override_warnings.clone();
        warnings.extend(self.toml.validate());
        warnings
    }
}
