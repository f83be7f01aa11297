//! Document store gateway over embedded SQLite.
//!
//! # Responsibility
//! - Own the single process-wide store connection.
//! - Establish the structural indexes before any operation is served.
//! - Expose collection-scoped insert/find primitives with bounded time.
//!
//! # Invariants
//! - A `Gateway` is only handed out after connectivity and indexes succeed.
//! - Store failures carry the collection and operation they happened in.
//! - Nothing here retries; each call is one best-effort attempt.

use crate::config::ConfigError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

mod bounded;
mod gateway;
pub mod indexes;

pub use bounded::CancelToken;
pub use gateway::{Gateway, HealthStatus, ScopedGateway, CONNECT_TIMEOUT, HEALTH_TIMEOUT};

pub type DbResult<T> = Result<T, DbError>;

/// Logical collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    CollectionEvents,
    ProcessingSteps,
    QrCodes,
}

impl Collection {
    pub const ALL: [Collection; 3] = [
        Collection::CollectionEvents,
        Collection::ProcessingSteps,
        Collection::QrCodes,
    ];

    /// Storage name, also the backing table name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::CollectionEvents => "collection_events",
            Self::ProcessingSteps => "processing_steps",
            Self::QrCodes => "qr_codes",
        }
    }
}

impl Display for Collection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Gateway operation names used in errors and log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Health,
    EnsureIndexes,
    InsertOne,
    FindOne,
    FindMany,
    Count,
    GeoWithin,
}

impl Operation {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Health => "health",
            Self::EnsureIndexes => "ensure_indexes",
            Self::InsertOne => "insert_one",
            Self::FindOne => "find_one",
            Self::FindMany => "find_many",
            Self::Count => "count",
            Self::GeoWithin => "geo_within",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Store-layer error.
#[derive(Debug)]
pub enum DbError {
    /// Required settings are absent or malformed.
    Config(ConfigError),
    /// Store unreachable or handshake did not complete.
    Connection {
        target: String,
        message: String,
        source: Option<rusqlite::Error>,
    },
    /// A required index could not be established.
    Index {
        index: &'static str,
        source: rusqlite::Error,
    },
    Write {
        collection: Collection,
        source: rusqlite::Error,
    },
    Read {
        collection: Collection,
        operation: Operation,
        source: rusqlite::Error,
    },
    /// The per-call deadline expired before the store answered.
    Timeout {
        operation: Operation,
        collection: Option<Collection>,
        timeout: Duration,
    },
    /// The request that owned the call cancelled its `CancelToken`.
    Cancelled {
        operation: Operation,
        collection: Option<Collection>,
    },
    /// The gateway was closed.
    Closed,
    Encode {
        collection: Collection,
        source: serde_json::Error,
    },
    Decode {
        collection: Collection,
        source: serde_json::Error,
    },
    /// Field path is not a dotted identifier.
    InvalidField(String),
    InvalidFilter {
        field: String,
        reason: &'static str,
    },
}

impl DbError {
    /// Whether the store rejected a write because a unique index matched.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            Self::Write { source, .. } => matches!(
                source,
                rusqlite::Error::SqliteFailure(err, _)
                    if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            ),
            _ => false,
        }
    }

    /// Whether the store rejected a write because a constraint or trigger
    /// check failed (includes duplicate keys and malformed geo points).
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::Write { source, .. } => matches!(
                source,
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation
            ),
            _ => false,
        }
    }

    /// Fatal startup failures: the process must not serve traffic.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Connection { .. } | Self::Index { .. }
        )
    }
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "store configuration error: {err}"),
            Self::Connection {
                target, message, ..
            } => write!(f, "cannot connect to store `{target}`: {message}"),
            Self::Index { index, source } => {
                write!(f, "cannot create index `{index}`: {source}")
            }
            Self::Write { collection, source } => {
                write!(f, "insert_one on `{collection}` failed: {source}")
            }
            Self::Read {
                collection,
                operation,
                source,
            } => write!(f, "{operation} on `{collection}` failed: {source}"),
            Self::Timeout {
                operation,
                collection: Some(collection),
                timeout,
            } => write!(
                f,
                "{operation} on `{collection}` timed out after {}ms",
                timeout.as_millis()
            ),
            Self::Timeout {
                operation,
                collection: None,
                timeout,
            } => write!(f, "{operation} timed out after {}ms", timeout.as_millis()),
            Self::Cancelled {
                operation,
                collection: Some(collection),
            } => write!(f, "{operation} on `{collection}` was cancelled"),
            Self::Cancelled {
                operation,
                collection: None,
            } => write!(f, "{operation} was cancelled"),
            Self::Closed => write!(f, "store connection is closed"),
            Self::Encode { collection, source } => {
                write!(f, "cannot encode document for `{collection}`: {source}")
            }
            Self::Decode { collection, source } => {
                write!(f, "cannot decode document from `{collection}`: {source}")
            }
            Self::InvalidField(field) => write!(f, "invalid field path `{field}`"),
            Self::InvalidFilter { field, reason } => {
                write!(f, "invalid filter on `{field}`: {reason}")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Connection {
                source: Some(err), ..
            } => Some(err),
            Self::Index { source, .. }
            | Self::Write { source, .. }
            | Self::Read { source, .. } => Some(source),
            Self::Encode { source, .. } | Self::Decode { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for DbError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}
