//! Configuration module
//!
//! Runner policy (timeouts, retries, bail, filters) and parallel settings,
//! loadable from YAML or JSON and overridable from the environment.

pub mod env;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub use env::EnvConfig;

/// Default per-runnable timeout, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 2_000;

/// Default slow threshold, in milliseconds
pub const DEFAULT_SLOW_MS: u64 = 75;

/// Runner configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Timeout for every test and hook; 0 disables enforcement
    pub timeout_ms: u64,

    /// Duration at which a passing test is reported slow
    pub slow_ms: u64,

    /// Retry budget for failing tests
    pub retries: u32,

    /// Stop at the first failure
    pub bail: bool,

    /// Only run tests whose full title contains this string
    pub grep: Option<String>,

    /// Run tests whose full title does NOT contain `grep`
    pub invert: bool,

    /// Refuse to run a tree that contains exclusive markers
    pub forbid_only: bool,

    /// Report pending tests as failures
    pub forbid_pending: bool,

    /// Parallel execution settings
    pub parallel: ParallelConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            slow_ms: DEFAULT_SLOW_MS,
            retries: 0,
            bail: false,
            grep: None,
            invert: false,
            forbid_only: false,
            forbid_pending: false,
            parallel: ParallelConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn slow(&self) -> Duration {
        Duration::from_millis(self.slow_ms)
    }

    /// Set the timeout; sub-millisecond values round up so they stay enforced
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = ceil_millis(timeout);
        self
    }

    pub fn with_slow(mut self, slow: Duration) -> Self {
        self.slow_ms = ceil_millis(slow);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_bail(mut self, bail: bool) -> Self {
        self.bail = bail;
        self
    }

    pub fn with_grep(mut self, pattern: impl Into<String>, invert: bool) -> Self {
        self.grep = Some(pattern.into());
        self.invert = invert;
        self
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.parallel.jobs = jobs;
        self
    }

    /// Build the configuration from the environment
    ///
    /// Starts from the file named by `SUITE_RUNNER_CONFIG` when set, defaults
    /// otherwise, then applies the other `SUITE_RUNNER_*` overrides.
    pub fn from_env() -> Result<Self> {
        Self::from_env_config(&EnvConfig::load())
    }

    pub fn from_env_config(env: &EnvConfig) -> Result<Self> {
        let base = match &env.config_file {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        let config = base.with_env(env);
        config.validate().context("Invalid configuration after environment overrides")?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = if is_yaml_file(path) {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = if is_yaml_file(path) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.parallel.jobs == 0 {
            anyhow::bail!("parallel.jobs must be at least 1");
        }
        if self.invert && self.grep.is_none() {
            anyhow::bail!("invert requires a grep pattern");
        }
        if matches!(&self.grep, Some(pattern) if pattern.is_empty()) {
            anyhow::bail!("grep pattern must not be empty");
        }
        Ok(())
    }

    /// Apply environment overrides on top of this configuration
    pub fn with_env(mut self, env: &EnvConfig) -> Self {
        if let Some(timeout) = env.timeout_ms {
            self.timeout_ms = timeout;
        }
        if let Some(slow) = env.slow_ms {
            self.slow_ms = slow;
        }
        if let Some(retries) = env.retries {
            self.retries = retries;
        }
        if let Some(bail) = env.bail {
            self.bail = bail;
        }
        if let Some(grep) = &env.grep {
            self.grep = Some(grep.clone());
        }
        if let Some(invert) = env.invert {
            self.invert = invert;
        }
        if let Some(forbid_only) = env.forbid_only {
            self.forbid_only = forbid_only;
        }
        if let Some(forbid_pending) = env.forbid_pending {
            self.forbid_pending = forbid_pending;
        }
        if let Some(jobs) = env.jobs {
            self.parallel.jobs = jobs;
        }
        self
    }
}

/// Parallel coordinator settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Number of workers
    pub jobs: usize,

    /// Crashed workers tolerated before the whole run fails
    pub worker_crash_tolerance: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        let jobs = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);
        Self {
            jobs,
            worker_crash_tolerance: 0,
        }
    }
}

fn ceil_millis(d: Duration) -> u64 {
    u64::try_from(d.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
