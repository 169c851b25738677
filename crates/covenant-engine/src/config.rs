//! Engine configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::EngineError;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Multi-line human-readable output.
    Pretty,
}

impl FromStr for LogFormat {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(EngineError::Config(format!(
                "COVENANT_LOG_FORMAT must be `json` or `pretty`, got `{other}`"
            ))),
        }
    }
}

/// Runtime settings of an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Repository snapshot cadence in events; 0 disables snapshots.
    pub snapshot_frequency: u64,
    /// How often running projections poll the event store.
    pub projection_poll_interval: Duration,
    /// Deadline of a single participant call during two-phase commit.
    pub participant_call_timeout: Duration,
    pub log_format: LogFormat,
    /// PostgreSQL connection string. The in-memory store is used when unset.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_frequency: 50,
            projection_poll_interval: Duration::from_millis(5_000),
            participant_call_timeout: Duration::from_millis(30_000),
            log_format: LogFormat::Json,
            database_url: None,
            db_max_connections: 10,
        }
    }
}

impl EngineConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, falling back to defaults for
    /// unset variables.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if a variable is set but cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let snapshot_frequency =
            parse_or(&lookup, "COVENANT_SNAPSHOT_FREQUENCY", defaults.snapshot_frequency)?;
        let poll_ms = parse_or(&lookup, "COVENANT_PROJECTION_POLL_INTERVAL_MS", 5_000_u64)?;
        let call_timeout_ms = parse_or(&lookup, "COVENANT_PARTICIPANT_CALL_TIMEOUT_MS", 30_000_u64)?;
        if poll_ms == 0 {
            return Err(EngineError::Config(
                "COVENANT_PROJECTION_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        if call_timeout_ms == 0 {
            return Err(EngineError::Config(
                "COVENANT_PARTICIPANT_CALL_TIMEOUT_MS must be positive".to_string(),
            ));
        }
        let log_format = match lookup("COVENANT_LOG_FORMAT") {
            Some(value) => value.parse()?,
            None => defaults.log_format,
        };
        let db_max_connections =
            parse_or(&lookup, "COVENANT_DB_MAX_CONNECTIONS", defaults.db_max_connections)?;

        Ok(Self {
            snapshot_frequency,
            projection_poll_interval: Duration::from_millis(poll_ms),
            participant_call_timeout: Duration::from_millis(call_timeout_ms),
            log_format,
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            db_max_connections,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, EngineError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| EngineError::Config(format!("{key} must be a valid number: {e}"))),
        None => Ok(default),
    }
}
