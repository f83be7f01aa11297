//! Process-wide store gateway.
//!
//! # Responsibility
//! - Connect with a bounded handshake and establish required indexes.
//! - Serve collection-scoped insert/find calls to concurrent callers.
//! - Provide a bounded liveness probe and an idempotent close.
//!
//! # Invariants
//! - Construction fails (and the connection is released) unless the ping and
//!   every index succeed.
//! - The handle is never re-pointed after construction; `close` only empties it.
//! - Documents keep `_id` in the `id` column and the rest as JSON in `doc`.
//! - Every call, the health probe included, starts its deadline before it
//!   waits for the connection.

use super::bounded::{lock_until, run_bounded, Acquire, CallFailure, CancelToken};
use super::indexes::{apply_indexes, ensure_collections, required_indexes};
use super::{Collection, DbError, DbResult, Operation};
use crate::config::{StoreConfig, StoreTarget};
use crate::model::geo::GeoBoundingBox;
use crate::model::object_id::ObjectId;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Upper bound for the connect handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for one liveness probe, including the wait for the connection.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

const ID_FIELD: &str = "_id";
const FIND_MANY_MAX_LIMIT: u32 = 1_000;
const PING_SQL: &str = "SELECT count(*) FROM sqlite_master;";

static FIELD_PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$")
        .expect("valid field path regex")
});

/// Result of a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { diagnostic: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy { diagnostic } => write!(f, "unhealthy: {diagnostic}"),
        }
    }
}

/// Shared handle to the document store.
///
/// One instance per process; pass `&Gateway` (or an `Arc`) into every
/// operation. Calls from many threads are serialized on the one connection,
/// and the wait for the connection counts against each call's deadline.
pub struct Gateway {
    conn: Mutex<Option<Connection>>,
    target: String,
    operation_timeout: Duration,
}

impl Debug for Gateway {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("target", &self.target)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Connects to the configured store, pings it and ensures indexes.
    ///
    /// # Errors
    /// - `DbError::Config` for absent or malformed settings.
    /// - `DbError::Connection` when the store is unreachable or the ping does
    ///   not complete within [`CONNECT_TIMEOUT`].
    /// - `DbError::Index` when a required index cannot be created.
    ///
    /// # Side effects
    /// - Emits `store_connect` events with duration and status.
    pub fn connect(config: &StoreConfig) -> DbResult<Self> {
        let started_at = Instant::now();
        config.validate()?;
        let target = config.describe_target();
        info!("event=store_connect module=db status=start target={target}");

        match Self::establish(config, &target) {
            Ok(gateway) => {
                info!(
                    "event=store_connect module=db status=ok target={} duration_ms={}",
                    target,
                    started_at.elapsed().as_millis()
                );
                Ok(gateway)
            }
            Err(err) => {
                error!(
                    "event=store_connect module=db status=error target={} duration_ms={} error={}",
                    target,
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Loads [`StoreConfig`] from the environment and connects.
    pub fn connect_from_env() -> DbResult<Self> {
        let config = StoreConfig::from_env()?;
        Self::connect(&config)
    }

    fn establish(config: &StoreConfig, target: &str) -> DbResult<Self> {
        let mut conn = open_connection(config, target)?;

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        if let Err(failure) = run_bounded(&conn, deadline, &CancelToken::new(), ping) {
            release(conn);
            return Err(connection_failure(target, failure));
        }

        if let Err(err) = bootstrap(&mut conn) {
            release(conn);
            return Err(err);
        }

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            target: target.to_string(),
            operation_timeout: config.operation_timeout,
        })
    }

    /// Re-applies the required indexes. Creating an existing index is a no-op.
    pub fn ensure_indexes(&self) -> DbResult<()> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        let mut guard = match lock_until(&self.conn, deadline, &CancelToken::new()) {
            Acquire::Locked(guard) => guard,
            Acquire::Failed(_) => {
                return Err(DbError::Timeout {
                    operation: Operation::EnsureIndexes,
                    collection: None,
                    timeout: CONNECT_TIMEOUT,
                })
            }
        };
        let conn = guard.as_mut().ok_or(DbError::Closed)?;
        bootstrap(conn)
    }

    /// Probes the connection. The whole probe, including the wait for a call
    /// already holding the connection, finishes within [`HEALTH_TIMEOUT`].
    /// Never mutates state.
    pub fn health(&self) -> HealthStatus {
        let deadline = Instant::now() + HEALTH_TIMEOUT;
        let token = CancelToken::new();

        let outcome = match lock_until(&self.conn, deadline, &token) {
            Acquire::Locked(guard) => match guard.as_ref() {
                Some(conn) => run_bounded(conn, deadline, &token, ping).map(|_| ()),
                None => {
                    return HealthStatus::Unhealthy {
                        diagnostic: DbError::Closed.to_string(),
                    }
                }
            },
            Acquire::Failed(failure) => Err(failure),
        };

        match outcome {
            Ok(()) => HealthStatus::Healthy,
            Err(failure) => {
                let diagnostic = match failure {
                    CallFailure::TimedOut => DbError::Timeout {
                        operation: Operation::Health,
                        collection: None,
                        timeout: HEALTH_TIMEOUT,
                    }
                    .to_string(),
                    CallFailure::Interrupted => DbError::Cancelled {
                        operation: Operation::Health,
                        collection: None,
                    }
                    .to_string(),
                    CallFailure::Sqlite(err) => err.to_string(),
                };
                warn!("event=store_health module=db status=error diagnostic={diagnostic}");
                HealthStatus::Unhealthy { diagnostic }
            }
        }
    }

    /// Releases the connection. Safe to call any number of times. Waits for
    /// the call currently holding the connection, which is itself bounded.
    pub fn close(&self) {
        let taken = self.lock().take();
        match taken {
            Some(conn) => {
                release(conn);
                info!(
                    "event=store_close module=db status=ok target={}",
                    self.target
                );
            }
            None => debug!("event=store_close module=db status=noop"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// View whose calls can be aborted through `token`. Cancelling the token
    /// affects only calls made through views holding it.
    pub fn scoped(&self, token: CancelToken) -> ScopedGateway<'_> {
        ScopedGateway {
            gateway: self,
            token,
        }
    }

    /// Inserts one record and returns the generated `_id`.
    ///
    /// Any `_id` already present on the record is ignored.
    pub fn insert_one<T: Serialize>(
        &self,
        collection: Collection,
        record: &T,
    ) -> DbResult<ObjectId> {
        self.scoped(CancelToken::new()).insert_one(collection, record)
    }

    /// Finds the first record whose `field` equals `value` exactly.
    ///
    /// `field` is a dotted path such as `qr_code` or `location.type`; `_id`
    /// matches the identifier.
    pub fn find_one_by_field<T: DeserializeOwned>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> DbResult<Option<T>> {
        self.scoped(CancelToken::new())
            .find_one_by_field(collection, field, value)
    }

    /// Finds up to `limit` records whose `field` equals `value`, in insertion
    /// order. `limit` is capped at 1000; zero returns nothing.
    pub fn find_many_by_field<T: DeserializeOwned>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
        limit: u32,
    ) -> DbResult<Vec<T>> {
        self.scoped(CancelToken::new())
            .find_many_by_field(collection, field, value, limit)
    }

    /// Every record whose `field` equals `value`, in insertion order.
    pub fn find_all_by_field<T: DeserializeOwned>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> DbResult<Vec<T>> {
        self.scoped(CancelToken::new())
            .find_all_by_field(collection, field, value)
    }

    pub fn count_documents(&self, collection: Collection) -> DbResult<u64> {
        self.scoped(CancelToken::new()).count_documents(collection)
    }

    /// Collection events whose location lies inside `bbox`, answered from the
    /// geospatial index and refined on exact coordinates.
    pub fn find_events_within<T: DeserializeOwned>(
        &self,
        bbox: &GeoBoundingBox,
        limit: u32,
    ) -> DbResult<Vec<T>> {
        self.scoped(CancelToken::new())
            .find_events_within(bbox, limit)
    }

    /// Runs `call` against the connection with one deadline covering the
    /// wait for the lock and the statement itself.
    fn call_until<T>(
        &self,
        deadline: Instant,
        token: &CancelToken,
        map_failure: impl Fn(CallFailure) -> DbError,
        call: impl FnMut(&Connection) -> rusqlite::Result<T>,
    ) -> DbResult<T> {
        let guard = match lock_until(&self.conn, deadline, token) {
            Acquire::Locked(guard) => guard,
            Acquire::Failed(failure) => return Err(map_failure(failure)),
        };
        let conn = guard.as_ref().ok_or(DbError::Closed)?;
        run_bounded(conn, deadline, token, call).map_err(map_failure)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        // A panicking caller cannot leave the connection half-updated: every
        // statement either completed or was rolled back by SQLite.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Gateway calls made on behalf of one request.
///
/// Every call is bounded by the gateway's operation timeout and aborts with
/// `DbError::Cancelled` once the request's token is cancelled, whether it is
/// still waiting for the connection or already running.
#[derive(Debug, Clone)]
pub struct ScopedGateway<'g> {
    gateway: &'g Gateway,
    token: CancelToken,
}

impl<'g> ScopedGateway<'g> {
    pub fn gateway(&self) -> &'g Gateway {
        self.gateway
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// See [`Gateway::insert_one`].
    pub fn insert_one<T: Serialize>(
        &self,
        collection: Collection,
        record: &T,
    ) -> DbResult<ObjectId> {
        let doc = encode_document(collection, record)?;
        let id = ObjectId::new();
        let id_hex = id.to_hex();
        let sql = format!("INSERT INTO {} (id, doc) VALUES (?1, ?2);", collection.name());
        let timeout = self.gateway.operation_timeout;

        self.gateway.call_until(
            self.deadline(),
            &self.token,
            |failure| failure.into_write(collection, timeout),
            |conn| conn.execute(&sql, params![id_hex, doc]),
        )?;

        debug!(
            "event=insert_one module=db status=ok collection={}",
            collection
        );
        Ok(id)
    }

    /// See [`Gateway::find_one_by_field`].
    pub fn find_one_by_field<T: DeserializeOwned>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> DbResult<Option<T>> {
        let query = FieldQuery::new(collection, field, value, Operation::FindOne)?;
        let mut rows = self.select_page(&query, 0, 1, self.deadline())?;
        match rows.pop() {
            Some(row) => decode_document(collection, row.id, &row.doc).map(Some),
            None => Ok(None),
        }
    }

    /// See [`Gateway::find_many_by_field`].
    pub fn find_many_by_field<T: DeserializeOwned>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
        limit: u32,
    ) -> DbResult<Vec<T>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = FieldQuery::new(collection, field, value, Operation::FindMany)?;
        let limit = limit.min(FIND_MANY_MAX_LIMIT);
        self.select_page(&query, 0, limit, self.deadline())?
            .into_iter()
            .map(|row| decode_document(collection, row.id, &row.doc))
            .collect()
    }

    /// See [`Gateway::find_all_by_field`].
    ///
    /// Reads in pages of 1000 keyed on insertion order, releasing the
    /// connection between pages. One operation timeout covers all pages.
    pub fn find_all_by_field<T: DeserializeOwned>(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> DbResult<Vec<T>> {
        let query = FieldQuery::new(collection, field, value, Operation::FindMany)?;
        let deadline = self.deadline();
        let mut records = Vec::new();
        let mut after = 0_i64;

        loop {
            let page = self.select_page(&query, after, FIND_MANY_MAX_LIMIT, deadline)?;
            let exhausted = page.len() < FIND_MANY_MAX_LIMIT as usize;
            for row in page {
                after = row.rowid;
                records.push(decode_document(collection, row.id, &row.doc)?);
            }
            if exhausted {
                return Ok(records);
            }
        }
    }

    /// See [`Gateway::count_documents`].
    pub fn count_documents(&self, collection: Collection) -> DbResult<u64> {
        let sql = format!("SELECT count(*) FROM {};", collection.name());
        let timeout = self.gateway.operation_timeout;
        let count: i64 = self.gateway.call_until(
            self.deadline(),
            &self.token,
            |failure| failure.into_read(Operation::Count, collection, timeout),
            |conn| conn.query_row(&sql, [], |row| row.get(0)),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// See [`Gateway::find_events_within`].
    pub fn find_events_within<T: DeserializeOwned>(
        &self,
        bbox: &GeoBoundingBox,
        limit: u32,
    ) -> DbResult<Vec<T>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let collection = Collection::CollectionEvents;
        let timeout = self.gateway.operation_timeout;
        let limit = i64::from(limit.min(FIND_MANY_MAX_LIMIT));

        let rows = self.gateway.call_until(
            self.deadline(),
            &self.token,
            |failure| failure.into_read(Operation::GeoWithin, collection, timeout),
            |conn| {
                let mut stmt = conn.prepare(
                    "SELECT events.id, events.doc
                     FROM collection_events_location_2dsphere AS geo
                     JOIN collection_events AS events ON events.id = geo.event_id
                     WHERE geo.max_lng >= ?1 AND geo.min_lng <= ?3
                       AND geo.max_lat >= ?2 AND geo.min_lat <= ?4
                       AND json_extract(events.doc, '$.location.coordinates[0]') BETWEEN ?1 AND ?3
                       AND json_extract(events.doc, '$.location.coordinates[1]') BETWEEN ?2 AND ?4
                     ORDER BY events.rowid
                     LIMIT ?5;",
                )?;
                let rows = stmt.query_map(
                    params![bbox.west, bbox.south, bbox.east, bbox.north, limit],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            },
        )?;

        rows.into_iter()
            .map(|(id, doc)| decode_document(collection, id, &doc))
            .collect()
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.gateway.operation_timeout
    }

    fn select_page(
        &self,
        query: &FieldQuery,
        after_rowid: i64,
        limit: u32,
        deadline: Instant,
    ) -> DbResult<Vec<StoredRow>> {
        let sql = format!(
            "SELECT rowid, id, doc FROM {} WHERE {} AND rowid > ? ORDER BY rowid LIMIT ?;",
            query.collection.name(),
            query.predicate
        );
        let mut bind_values = query.bind_values.clone();
        bind_values.push(SqlValue::Integer(after_rowid));
        bind_values.push(SqlValue::Integer(i64::from(limit)));
        let (collection, operation) = (query.collection, query.operation);
        let timeout = self.gateway.operation_timeout;

        self.gateway.call_until(
            deadline,
            &self.token,
            |failure| failure.into_read(operation, collection, timeout),
            |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(bind_values.iter()), |row| {
                    Ok(StoredRow {
                        rowid: row.get(0)?,
                        id: row.get(1)?,
                        doc: row.get(2)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            },
        )
    }
}

/// Validated exact-match filter on one collection.
struct FieldQuery {
    collection: Collection,
    operation: Operation,
    predicate: String,
    bind_values: Vec<SqlValue>,
}

impl FieldQuery {
    fn new(
        collection: Collection,
        field: &str,
        value: &Value,
        operation: Operation,
    ) -> DbResult<Self> {
        let (predicate, bind_values) = field_predicate(field, value)?;
        Ok(Self {
            collection,
            operation,
            predicate,
            bind_values,
        })
    }
}

struct StoredRow {
    rowid: i64,
    id: String,
    doc: String,
}

fn open_connection(config: &StoreConfig, target: &str) -> DbResult<Connection> {
    let connection_error = |message: String, source: Option<rusqlite::Error>| DbError::Connection {
        target: target.to_string(),
        message,
        source,
    };

    // Default flags: read-write, create, URI filenames, no internal mutex.
    let opened = match config.target()? {
        StoreTarget::Memory => Connection::open_with_flags(
            format!("file:{}?mode=memory", config.database),
            OpenFlags::default(),
        ),
        StoreTarget::Directory(dir) => {
            if !dir.is_dir() {
                return Err(connection_error(
                    format!("directory `{}` does not exist", dir.display()),
                    None,
                ));
            }
            Connection::open_with_flags(
                dir.join(format!("{}.sqlite3", config.database)),
                OpenFlags::default(),
            )
        }
    };

    opened.map_err(|err| connection_error(err.to_string(), Some(err)))
}

fn bootstrap(conn: &mut Connection) -> DbResult<()> {
    conn.busy_timeout(CONNECT_TIMEOUT)
        .and_then(|()| ensure_collections(conn))
        .map_err(|source| DbError::Index {
            index: "collections",
            source,
        })?;
    apply_indexes(conn)?;

    for index in required_indexes() {
        debug!(
            "event=index_ensure module=db status=ok index={} collection={}",
            index.name, index.collection
        );
    }
    Ok(())
}

fn ping(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row(PING_SQL, [], |row| row.get(0))
}

fn connection_failure(target: &str, failure: CallFailure) -> DbError {
    let (message, source) = match failure {
        CallFailure::TimedOut => (
            format!(
                "handshake did not complete within {}ms",
                CONNECT_TIMEOUT.as_millis()
            ),
            None,
        ),
        CallFailure::Interrupted => ("handshake was interrupted".to_string(), None),
        CallFailure::Sqlite(err) => (err.to_string(), Some(err)),
    };
    DbError::Connection {
        target: target.to_string(),
        message,
        source,
    }
}

fn release(conn: Connection) {
    if let Err((_conn, err)) = conn.close() {
        warn!("event=store_release module=db status=error error={err}");
    }
}

fn encode_document<T: Serialize>(collection: Collection, record: &T) -> DbResult<String> {
    let encoded = serde_json::to_value(record)
        .map_err(|source| DbError::Encode { collection, source })?;
    let Value::Object(mut object) = encoded else {
        return Err(DbError::Encode {
            collection,
            source: serde::ser::Error::custom("document must serialize to a JSON object"),
        });
    };
    object.remove(ID_FIELD);
    serde_json::to_string(&object).map_err(|source| DbError::Encode { collection, source })
}

fn decode_document<T: DeserializeOwned>(
    collection: Collection,
    id: String,
    doc: &str,
) -> DbResult<T> {
    let mut object: Map<String, Value> =
        serde_json::from_str(doc).map_err(|source| DbError::Decode { collection, source })?;
    object.insert(ID_FIELD.to_string(), Value::String(id));
    serde_json::from_value(Value::Object(object))
        .map_err(|source| DbError::Decode { collection, source })
}

/// Builds an exact-match predicate. The JSON path is inlined so expression
/// indexes such as `json_extract(doc, '$.qr_code')` are usable.
fn field_predicate(field: &str, value: &Value) -> DbResult<(String, Vec<SqlValue>)> {
    if field == ID_FIELD {
        return match value {
            Value::String(id) => Ok(("id = ?".to_string(), vec![SqlValue::Text(id.clone())])),
            _ => Err(DbError::InvalidFilter {
                field: field.to_string(),
                reason: "`_id` must be matched against a string",
            }),
        };
    }
    if !FIELD_PATH_RE.is_match(field) {
        return Err(DbError::InvalidField(field.to_string()));
    }

    let column = format!("json_extract(doc, '$.{field}')");
    let bound = match value {
        Value::Null => return Ok((format!("{column} IS NULL"), Vec::new())),
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(int), _) => SqlValue::Integer(int),
            (None, Some(real)) => SqlValue::Real(real),
            (None, None) => {
                return Err(DbError::InvalidFilter {
                    field: field.to_string(),
                    reason: "number is out of range",
                })
            }
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(DbError::InvalidFilter {
                field: field.to_string(),
                reason: "only scalar values can be matched",
            })
        }
    };
    Ok((format!("{column} = ?"), vec![bound]))
}
