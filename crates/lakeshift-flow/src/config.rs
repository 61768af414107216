//! Orchestrator configuration.
//!
//! Values come from the process environment with strict validation: a set but
//! malformed variable is an error, never silently replaced by its default.

use std::time::Duration;

use lakeshift_core::LogFormat;

use crate::error::{Error, Result};

const ENV_LOCK_TTL_SECS: &str = "LAKESHIFT_LOCK_TTL_SECS";
const ENV_TESTER_TIMEOUT_SECS: &str = "LAKESHIFT_TESTER_TIMEOUT_SECS";
const ENV_SCOPE_POLL_ATTEMPTS: &str = "LAKESHIFT_SCOPE_POLL_ATTEMPTS";
const ENV_SCOPE_POLL_INTERVAL_MS: &str = "LAKESHIFT_SCOPE_POLL_INTERVAL_MS";
const ENV_DATASET_ROOT: &str = "LAKESHIFT_DATASET_ROOT";
const ENV_ARCHIVE_ROOT: &str = "LAKESHIFT_ARCHIVE_ROOT";
const ENV_SANDBOX_ROOT: &str = "LAKESHIFT_SANDBOX_ROOT";
const ENV_LOG_FORMAT: &str = "LAKESHIFT_LOG_FORMAT";

const DEFAULT_LOCK_TTL_SECS: u64 = 900;
const DEFAULT_TESTER_TIMEOUT_SECS: u64 = 600;
const DEFAULT_SCOPE_POLL_ATTEMPTS: u64 = 30;
const DEFAULT_SCOPE_POLL_INTERVAL_MS: u64 = 2_000;

/// Settings for [`crate::SchemaChangeOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// TTL of the family lock; renewed while a step runs and after it.
    pub lock_ttl: Duration,
    /// Bound on a compatibility-test transform run. Must be below `lock_ttl`.
    pub tester_timeout: Duration,
    /// How many times scope registration is polled before giving up.
    pub scope_poll_attempts: u32,
    /// Delay between scope registration polls.
    pub scope_poll_interval: Duration,
    /// Prefix under which dataset versions are stored.
    pub dataset_root: String,
    /// Prefix under which archive slots are created.
    pub archive_root: String,
    /// Prefix under which compatibility-test sandboxes are created.
    pub sandbox_root: String,
    /// Log output format for binaries embedding the orchestrator.
    pub log_format: LogFormat,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            tester_timeout: Duration::from_secs(DEFAULT_TESTER_TIMEOUT_SECS),
            scope_poll_attempts: 30,
            scope_poll_interval: Duration::from_millis(DEFAULT_SCOPE_POLL_INTERVAL_MS),
            dataset_root: "datasets".into(),
            archive_root: "archive".into(),
            sandbox_root: "sandbox".into(),
            log_format: LogFormat::Json,
        }
    }
}

impl OrchestratorConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a variable is set to an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Loads configuration with a custom environment source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a numeric value is not a positive
    /// integer, a root prefix is empty or absolute, the log format is unknown,
    /// or the tester timeout does not fit inside the lock TTL.
    pub fn from_env_with<F>(get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lock_ttl_secs =
            parse_positive_u64_env(&get_env, ENV_LOCK_TTL_SECS, DEFAULT_LOCK_TTL_SECS)?;
        let tester_timeout_secs =
            parse_positive_u64_env(&get_env, ENV_TESTER_TIMEOUT_SECS, DEFAULT_TESTER_TIMEOUT_SECS)?;
        let poll_attempts =
            parse_positive_u64_env(&get_env, ENV_SCOPE_POLL_ATTEMPTS, DEFAULT_SCOPE_POLL_ATTEMPTS)?;
        let poll_interval_ms = parse_positive_u64_env(
            &get_env,
            ENV_SCOPE_POLL_INTERVAL_MS,
            DEFAULT_SCOPE_POLL_INTERVAL_MS,
        )?;

        let scope_poll_attempts = u32::try_from(poll_attempts).map_err(|_| {
            Error::configuration(format!(
                "{ENV_SCOPE_POLL_ATTEMPTS} value {poll_attempts} exceeds supported range"
            ))
        })?;

        let log_format = match get_env(ENV_LOG_FORMAT) {
            Some(raw) => raw.parse::<LogFormat>()?,
            None => LogFormat::Json,
        };

        let config = Self {
            lock_ttl: Duration::from_secs(lock_ttl_secs),
            tester_timeout: Duration::from_secs(tester_timeout_secs),
            scope_poll_attempts,
            scope_poll_interval: Duration::from_millis(poll_interval_ms),
            dataset_root: parse_root_env(&get_env, ENV_DATASET_ROOT, "datasets")?,
            archive_root: parse_root_env(&get_env, ENV_ARCHIVE_ROOT, "archive")?,
            sandbox_root: parse_root_env(&get_env, ENV_SANDBOX_ROOT, "sandbox")?,
            log_format,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the lock TTL is zero or the tester
    /// timeout is not strictly below it.
    pub fn validate(&self) -> Result<()> {
        if self.lock_ttl.is_zero() {
            return Err(Error::configuration(format!(
                "{ENV_LOCK_TTL_SECS} must be greater than zero"
            )));
        }
        if self.tester_timeout >= self.lock_ttl {
            return Err(Error::configuration(format!(
                "{ENV_TESTER_TIMEOUT_SECS} ({}s) must be below {ENV_LOCK_TTL_SECS} ({}s)",
                self.tester_timeout.as_secs(),
                self.lock_ttl.as_secs()
            )));
        }
        Ok(())
    }

    /// How often a driver renews the family lock while a step runs.
    #[must_use]
    pub fn lock_heartbeat(&self) -> Duration {
        (self.lock_ttl / 3).max(Duration::from_millis(1))
    }
}

fn parse_positive_u64_env<F>(get_env: &F, key: &str, default: u64) -> Result<u64>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default);
    };

    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        Error::configuration(format!("{key} must be a positive integer, got '{raw}'"))
    })?;
    if parsed == 0 {
        return Err(Error::configuration(format!("{key} must be greater than zero")));
    }
    Ok(parsed)
}

fn parse_root_env<F>(get_env: &F, key: &str, default: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = get_env(key) else {
        return Ok(default.to_string());
    };

    let root = raw.trim().trim_end_matches('/');
    if root.is_empty() || root.starts_with('/') {
        return Err(Error::configuration(format!(
            "{key} must be a non-empty relative prefix, got '{raw}'"
        )));
    }
    Ok(root.to_string())
}
