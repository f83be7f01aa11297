//! Store configuration loaded from the environment.
//!
//! # Responsibility
//! - Read connection settings from process env, honoring a local `.env`.
//! - Reject absent or malformed settings before any connection attempt.
//!
//! # Invariants
//! - `uri` and `database` are required and non-blank.
//! - `operation_timeout` is strictly positive.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const ENV_STORE_URI: &str = "AYURTRACE_STORE_URI";
pub const ENV_STORE_DB: &str = "AYURTRACE_STORE_DB";
pub const ENV_STORE_OP_TIMEOUT_MS: &str = "AYURTRACE_STORE_OP_TIMEOUT_MS";

/// Per-call deadline applied to inserts and lookups unless overridden.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// URI selecting a private in-memory database.
pub const MEMORY_URI: &str = "sqlite::memory:";
const FILE_URI_PREFIX: &str = "sqlite://";

static DATABASE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("valid database name regex"));

/// Configuration error raised before any connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required key is absent or blank.
    Missing(&'static str),
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Missing(key) => write!(f, "{key} not set"),
            Self::Invalid { key, value, reason } => {
                write!(f, "{key}=`{value}` is invalid: {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    /// Private in-memory database, discarded on close.
    Memory,
    /// Database file `<directory>/<database>.sqlite3`.
    Directory(std::path::PathBuf),
}

/// Recognized store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// `sqlite::memory:`, `sqlite://<dir>` or a bare directory path.
    pub uri: String,
    /// Logical database name.
    pub database: String,
    pub operation_timeout: Duration,
}

impl StoreConfig {
    /// Builds a config with the default operation timeout.
    pub fn new(uri: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            database: database.into(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// Convenience config for a private in-memory store.
    pub fn in_memory(database: impl Into<String>) -> Self {
        Self::new(MEMORY_URI, database)
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Loads settings from the process environment after reading `.env` if
    /// one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal outside local development.
        let _ = dotenv::dotenv();
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    /// Loads settings through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let uri = required(&lookup, ENV_STORE_URI)?;
        let database = required(&lookup, ENV_STORE_DB)?;
        let operation_timeout = match lookup(ENV_STORE_OP_TIMEOUT_MS) {
            Some(raw) if !raw.trim().is_empty() => parse_timeout_ms(raw.trim())?,
            _ => DEFAULT_OPERATION_TIMEOUT,
        };

        let config = Self {
            uri,
            database,
            operation_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks every field without touching the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.uri.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_STORE_URI));
        }
        if self.database.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_STORE_DB));
        }
        if !DATABASE_NAME_RE.is_match(&self.database) {
            return Err(ConfigError::Invalid {
                key: ENV_STORE_DB,
                value: self.database.clone(),
                reason: "expected 1-64 characters of [A-Za-z0-9_-]",
            });
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: ENV_STORE_OP_TIMEOUT_MS,
                value: "0".to_string(),
                reason: "timeout must be greater than zero",
            });
        }
        self.target().map(|_| ())
    }

    /// Resolves the URI into a concrete target.
    pub fn target(&self) -> Result<StoreTarget, ConfigError> {
        let uri = self.uri.trim();
        if uri == MEMORY_URI {
            return Ok(StoreTarget::Memory);
        }

        let directory = uri.strip_prefix(FILE_URI_PREFIX).unwrap_or(uri);
        if directory.is_empty() {
            return Err(ConfigError::Invalid {
                key: ENV_STORE_URI,
                value: self.uri.clone(),
                reason: "directory path is empty",
            });
        }
        Ok(StoreTarget::Directory(directory.into()))
    }

    /// Log-safe description of the target.
    pub fn describe_target(&self) -> String {
        match self.target() {
            Ok(StoreTarget::Memory) => format!("memory/{}", self.database),
            Ok(StoreTarget::Directory(dir)) => {
                format!("{}/{}.sqlite3", dir.display(), self.database)
            }
            Err(_) => format!("invalid/{}", self.database),
        }
    }
}

fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn parse_timeout_ms(raw: &str) -> Result<Duration, ConfigError> {
    match raw.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ConfigError::Invalid {
            key: ENV_STORE_OP_TIMEOUT_MS,
            value: raw.to_string(),
            reason: "expected a positive integer number of milliseconds",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConfigError, StoreConfig, StoreTarget, DEFAULT_OPERATION_TIMEOUT, ENV_STORE_DB,
        ENV_STORE_OP_TIMEOUT_MS, ENV_STORE_URI,
    };
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn missing_uri_or_database_is_rejected() {
        let err = StoreConfig::from_lookup(lookup_from(&[(ENV_STORE_DB, "ayur")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_STORE_URI));

        let err = StoreConfig::from_lookup(lookup_from(&[
            (ENV_STORE_URI, "sqlite::memory:"),
            (ENV_STORE_DB, "  "),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::Missing(ENV_STORE_DB));
    }

    #[test]
    fn loads_defaults_and_targets() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            (ENV_STORE_URI, "sqlite:///var/lib/ayurtrace"),
            (ENV_STORE_DB, "ayurtrace"),
        ]))
        .unwrap();
        assert_eq!(config.operation_timeout, DEFAULT_OPERATION_TIMEOUT);
        assert_eq!(
            config.target().unwrap(),
            StoreTarget::Directory(PathBuf::from("/var/lib/ayurtrace"))
        );
        assert_eq!(
            StoreConfig::in_memory("ayurtrace").target().unwrap(),
            StoreTarget::Memory
        );
    }

    #[test]
    fn timeout_and_database_name_are_validated() {
        let config = StoreConfig::from_lookup(lookup_from(&[
            (ENV_STORE_URI, "/tmp"),
            (ENV_STORE_DB, "ayur"),
            (ENV_STORE_OP_TIMEOUT_MS, "2500"),
        ]))
        .unwrap();
        assert_eq!(config.operation_timeout, Duration::from_millis(2500));

        let err = StoreConfig::from_lookup(lookup_from(&[
            (ENV_STORE_URI, "/tmp"),
            (ENV_STORE_DB, "ayur"),
            (ENV_STORE_OP_TIMEOUT_MS, "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == ENV_STORE_OP_TIMEOUT_MS));

        let err = StoreConfig::from_lookup(lookup_from(&[
            (ENV_STORE_URI, "/tmp"),
            (ENV_STORE_DB, "../escape"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == ENV_STORE_DB));
    }
}
