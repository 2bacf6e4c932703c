//! Environment variable configuration
//!
//! Provides environment variable overrides for [`RunnerConfig`](super::RunnerConfig).

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "SUITE_RUNNER";

/// Overrides read from `SUITE_RUNNER_*` variables
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvConfig {
    /// Timeout from SUITE_RUNNER_TIMEOUT (milliseconds)
    pub timeout_ms: Option<u64>,
    /// Slow threshold from SUITE_RUNNER_SLOW (milliseconds)
    pub slow_ms: Option<u64>,
    /// Retries from SUITE_RUNNER_RETRIES
    pub retries: Option<u32>,
    /// Bail from SUITE_RUNNER_BAIL
    pub bail: Option<bool>,
    /// Grep from SUITE_RUNNER_GREP
    pub grep: Option<String>,
    /// Invert from SUITE_RUNNER_INVERT
    pub invert: Option<bool>,
    /// Forbid-only from SUITE_RUNNER_FORBID_ONLY
    pub forbid_only: Option<bool>,
    /// Forbid-pending from SUITE_RUNNER_FORBID_PENDING
    pub forbid_pending: Option<bool>,
    /// Jobs from SUITE_RUNNER_JOBS
    pub jobs: Option<usize>,
    /// Base config file from SUITE_RUNNER_CONFIG, applied before the overrides
    pub config_file: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            timeout_ms: get_env_parse("TIMEOUT"),
            slow_ms: get_env_parse("SLOW"),
            retries: get_env_parse("RETRIES"),
            bail: get_env_bool("BAIL"),
            grep: get_env("GREP"),
            invert: get_env_bool("INVERT"),
            forbid_only: get_env_bool("FORBID_ONLY"),
            forbid_pending: get_env_bool("FORBID_PENDING"),
            jobs: get_env_parse("JOBS"),
            config_file: get_env("CONFIG"),
        }
    }

    /// Check if any environment variables are set
    pub fn has_any(&self) -> bool {
        self.timeout_ms.is_some()
            || self.slow_ms.is_some()
            || self.retries.is_some()
            || self.bail.is_some()
            || self.grep.is_some()
            || self.invert.is_some()
            || self.forbid_only.is_some()
            || self.forbid_pending.is_some()
            || self.jobs.is_some()
            || self.config_file.is_some()
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
#[derive(Default)]
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_TIMEOUT"), timeout_ms.to_string()));
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_RETRIES"), retries.to_string()));
        self
    }

    pub fn bail(mut self, bail: bool) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_BAIL"), bail.to_string()));
        self
    }

    pub fn grep(mut self, pattern: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_GREP"), pattern.into()));
        self
    }

    pub fn forbid_pending(mut self, forbid: bool) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_FORBID_PENDING"), forbid.to_string()));
        self
    }

    pub fn config_file(mut self, path: impl Into<String>) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_CONFIG"), path.into()));
        self
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        for (key, value) in self.vars {
            env::set_var(key, value);
        }

        EnvGuard { previous }
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}
