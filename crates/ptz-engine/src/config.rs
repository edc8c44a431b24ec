use crate::retry::RetryPolicy;
use anyhow::{ensure, Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tuning knobs shared by every session of an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound on any single transport call
    pub call_timeout: Duration,
    /// Retries after the first attempt for transient failures
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry
    pub backoff_base: Duration,
    /// Consecutive `CommandFailed` on a confirmed capability before the
    /// session degrades and refreshes
    pub degrade_threshold: u32,
    /// Retries for the preset listing during a probe
    pub preset_probe_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff_base: Duration::from_millis(200),
            degrade_threshold: 3,
            preset_probe_retries: 1,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let default_timeout_ms = defaults.call_timeout.as_millis() as u64;
        let call_timeout_ms = env_or("PTZ_CALL_TIMEOUT_MS", default_timeout_ms)?;
        let max_retries = env_or("PTZ_MAX_RETRIES", defaults.max_retries)?;
        let backoff_base_ms =
            env_or("PTZ_BACKOFF_BASE_MS", defaults.backoff_base.as_millis() as u64)?;
        let degrade_threshold = env_or("PTZ_DEGRADE_THRESHOLD", defaults.degrade_threshold)?;
        let preset_probe_retries =
            env_or("PTZ_PRESET_PROBE_RETRIES", defaults.preset_probe_retries)?;

        let config = Self {
            call_timeout: Duration::from_millis(call_timeout_ms),
            max_retries,
            backoff_base: Duration::from_millis(backoff_base_ms),
            degrade_threshold,
            preset_probe_retries,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.call_timeout.is_zero(), "PTZ call timeout must be non-zero");
        ensure!(self.degrade_threshold > 0, "PTZ degrade threshold must be at least 1");
        Ok(())
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_base: Duration) -> Self {
        self.max_retries = max_retries;
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_degrade_threshold(mut self, threshold: u32) -> Self {
        self.degrade_threshold = threshold;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff_base: self.backoff_base,
            call_timeout: self.call_timeout,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}
