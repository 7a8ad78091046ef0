//! Conflux runtime configuration
//!
//! Startup parameters of a cluster, built from a flat list of `name=value`
//! pairs.
//!
//! # Configuration sources
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments (-n, -q, -v, -b, -t, -s name=value)
//! 2. Config file assignments (-f file)
//! 3. Default values
//! ```
//!
//! Environment injections (`-E name=value`) are carried separately and
//! applied to the process environment without overwriting existing
//! variables.
//!
//! # Usage
//!
//! ```rust
//! use conflux::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_pairs([("numLocales", "4"), ("taskreport", "true")]).unwrap();
//! assert_eq!(config.num_domains, 4);
//! ```

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::runtime::scheduler::SchedulerConfig;
use crate::util::logger::LogLevel;

static GLOBAL: OnceCell<RuntimeConfig> = OnceCell::new();

/// How chatty the runtime is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    /// Level used by the logger.
    pub fn log_level(self) -> LogLevel {
        match self {
            Verbosity::Quiet => LogLevel::Warn,
            Verbosity::Normal => LogLevel::Info,
            Verbosity::Verbose => LogLevel::Debug,
        }
    }
}

/// Startup parameters of a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Number of execution domains.
    #[serde(default = "default_num_domains")]
    pub num_domains: usize,
    #[serde(default)]
    pub verbosity: Verbosity,
    /// Include suspended tasks in diagnostics snapshots.
    #[serde(default)]
    pub block_report: bool,
    /// Include the task tree in diagnostics snapshots.
    #[serde(default)]
    pub task_report: bool,
    /// Execution slots per domain; 0 means one per CPU.
    #[serde(default)]
    pub workers: usize,
    #[serde(default = "default_sub_regions")]
    pub sub_regions: usize,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Bytes of domain memory; 0 means unbounded.
    #[serde(default)]
    pub memory_limit: usize,
    /// Environment injections, in order.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Unrecognized assignments, kept as program config variables.
    #[serde(default)]
    pub config_vars: IndexMap<String, String>,
}

fn default_num_domains() -> usize {
    1
}

fn default_sub_regions() -> usize {
    1
}

fn default_max_tasks() -> usize {
    SchedulerConfig::default().max_tasks
}

fn default_max_threads() -> usize {
    SchedulerConfig::default().max_threads
}

fn default_max_queue_size() -> usize {
    SchedulerConfig::default().max_queue_size
}

fn default_idle_timeout_ms() -> u64 {
    50
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_domains: default_num_domains(),
            verbosity: Verbosity::default(),
            block_report: false,
            task_report: false,
            workers: 0,
            sub_regions: default_sub_regions(),
            max_tasks: default_max_tasks(),
            max_threads: default_max_threads(),
            max_queue_size: default_max_queue_size(),
            idle_timeout_ms: default_idle_timeout_ms(),
            memory_limit: 0,
            env: Vec::new(),
            config_vars: IndexMap::new(),
        }
    }
}

impl RuntimeConfig {
    /// Build a config from `name=value` pairs, applied in order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Apply one assignment. Unknown keys become config variables.
    pub fn set(
        &mut self,
        key: &str,
        value: &str,
    ) -> Result<(), ConfigError> {
        match key {
            "numLocales" | "num_domains" => {
                self.num_domains = match value.trim().parse::<usize>() {
                    Ok(n) if n >= 1 => n,
                    _ => return Err(ConfigError::InvalidDomainCount(value.to_string())),
                };
            },
            "verbosity" => {
                self.verbosity = match value.trim() {
                    "0" | "quiet" => Verbosity::Quiet,
                    "1" | "normal" => Verbosity::Normal,
                    "2" | "verbose" => Verbosity::Verbose,
                    _ => return Err(invalid(key, value)),
                };
            },
            "blockreport" | "block_report" => self.block_report = parse_bool(key, value)?,
            "taskreport" | "task_report" => self.task_report = parse_bool(key, value)?,
            "workers" => self.workers = parse_number(key, value)?,
            "sub_regions" => self.sub_regions = parse_number(key, value)?.max(1),
            "max_tasks" => self.max_tasks = parse_number(key, value)?,
            "max_threads" => self.max_threads = parse_number(key, value)?,
            "max_queue_size" => self.max_queue_size = parse_number(key, value)?,
            "idle_timeout_ms" => self.idle_timeout_ms = parse_number(key, value)? as u64,
            "memory_limit" => self.memory_limit = parse_number(key, value)?,
            _ => {
                debug!("config variable {} = {}", key, value);
                self.config_vars.insert(key.to_string(), value.to_string());
            },
        }
        Ok(())
    }

    /// Apply every assignment in a config file.
    pub fn load_file(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<(), ConfigError> {
        for (key, value) in parse_config_file(path)? {
            self.set(&key, &value)?;
        }
        Ok(())
    }

    /// Record an environment injection of the form `name=value`.
    pub fn add_env(
        &mut self,
        entry: &str,
    ) -> Result<(), ConfigError> {
        match entry.split_once('=') {
            Some((name, value)) if !name.is_empty() && !name.contains(char::is_whitespace) => {
                self.env.push((name.to_string(), value.to_string()));
                Ok(())
            },
            _ => Err(ConfigError::MalformedEnv(entry.to_string())),
        }
    }

    /// Set injected variables that are not already present. Returns the
    /// names that were set.
    pub fn apply_environment(&self) -> Vec<String> {
        let mut applied = Vec::new();
        for (name, value) in &self.env {
            if std::env::var_os(name).is_none() {
                std::env::set_var(name, value);
                applied.push(name.clone());
            }
        }
        applied
    }

    /// Value of a config variable override.
    pub fn config_var(
        &self,
        name: &str,
    ) -> Option<&str> {
        self.config_vars.get(name).map(String::as_str)
    }

    /// Worker pool settings for one domain.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let defaults = SchedulerConfig::default();
        SchedulerConfig {
            num_workers: match self.workers {
                0 => defaults.num_workers,
                n => n,
            },
            sub_regions: self.sub_regions.max(1),
            max_tasks: self.max_tasks,
            max_threads: self.max_threads,
            max_queue_size: self.max_queue_size,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            ..defaults
        }
    }

    pub fn log_level(&self) -> LogLevel {
        self.verbosity.log_level()
    }
}

fn invalid(
    key: &str,
    value: &str,
) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_bool(
    key: &str,
    value: &str,
) -> Result<bool, ConfigError> {
    match value.trim() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_number(
    key: &str,
    value: &str,
) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

/// Read a config file of `name=value` assignments.
pub fn parse_config_file(path: impl AsRef<Path>) -> Result<Vec<(String, String)>, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_assignments(&content)
}

/// Split text into `name=value` assignments.
///
/// Assignments are separated by whitespace, `#` starts a comment that runs
/// to the end of the line, and values may be wrapped in single or double
/// quotes to include whitespace.
pub fn parse_assignments(text: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut assignments = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '#' {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
            continue;
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() || chars.next_if_eq(&'=').is_none() {
            return Err(ConfigError::MalformedAssignment(name));
        }

        let mut value = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_whitespace() {
                break;
            }
            chars.next();
            if c == '"' || c == '\'' {
                let mut closed = false;
                for q in chars.by_ref() {
                    if q == c {
                        closed = true;
                        break;
                    }
                    value.push(q);
                }
                if !closed {
                    return Err(ConfigError::MalformedAssignment(format!("{}={}", name, value)));
                }
            } else {
                value.push(c);
            }
        }
        assignments.push((name, value));
    }

    Ok(assignments)
}

/// Install the process-wide configuration. Only the first call succeeds.
pub fn install(config: RuntimeConfig) -> Result<&'static RuntimeConfig, ConfigError> {
    GLOBAL.set(config).map_err(|_| ConfigError::AlreadyInstalled)?;
    GLOBAL.get().ok_or(ConfigError::AlreadyInstalled)
}

/// The installed configuration, if any.
pub fn global() -> Option<&'static RuntimeConfig> {
    GLOBAL.get()
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("number of domains must be an integer >= 1, got {0:?}")]
    InvalidDomainCount(String),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("malformed assignment {0:?}, expected name=value")]
    MalformedAssignment(String),
    #[error("malformed environment entry {0:?}, expected name=value")]
    MalformedEnv(String),
    #[error("runtime configuration is already installed")]
    AlreadyInstalled,
}
