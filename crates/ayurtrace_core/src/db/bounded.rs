//! Time-bounded and cancellable statement execution.
//!
//! # Invariants
//! - The deadline is fixed before the connection lock is requested; waiting
//!   for the lock, retrying a busy store and running the statement all count
//!   against it.
//! - Cancellation is per call: a `CancelToken` only aborts calls it was
//!   passed to.
//! - Every call installs a fresh progress handler and clears it afterwards, so
//!   a stale deadline never leaks into the next call on the shared connection.
//! - An interrupted statement is rolled back by SQLite; nothing is committed.

use super::{Collection, DbError, Operation};
use rusqlite::{Connection, ErrorCode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

/// Number of VM instructions between deadline checks.
const PROGRESS_CHECK_STEPS: i32 = 1_000;
/// Pause between attempts while the connection or the store is busy.
const RETRY_PAUSE: Duration = Duration::from_millis(5);

/// Cancellation flag owned by one request.
///
/// Clones share the flag. Cancelling aborts the calls made with this token,
/// whether they are still waiting for the connection or already running.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Raw failure of one bounded call before collection context is attached.
#[derive(Debug)]
pub(crate) enum CallFailure {
    TimedOut,
    Interrupted,
    Sqlite(rusqlite::Error),
}

impl CallFailure {
    pub(crate) fn into_read(
        self,
        operation: Operation,
        collection: Collection,
        timeout: Duration,
    ) -> DbError {
        match self {
            Self::TimedOut => DbError::Timeout {
                operation,
                collection: Some(collection),
                timeout,
            },
            Self::Interrupted => DbError::Cancelled {
                operation,
                collection: Some(collection),
            },
            Self::Sqlite(source) => DbError::Read {
                collection,
                operation,
                source,
            },
        }
    }

    pub(crate) fn into_write(self, collection: Collection, timeout: Duration) -> DbError {
        match self {
            Self::Sqlite(source) => DbError::Write { collection, source },
            other => other.into_read(Operation::InsertOne, collection, timeout),
        }
    }
}

/// Outcome of waiting for the shared connection.
pub(crate) enum Acquire<'a, T> {
    Locked(MutexGuard<'a, T>),
    Failed(CallFailure),
}

/// Waits for `mutex` until `deadline`, giving up early once `token` is
/// cancelled. A poisoned lock is recovered.
pub(crate) fn lock_until<'a, T>(
    mutex: &'a Mutex<T>,
    deadline: Instant,
    token: &CancelToken,
) -> Acquire<'a, T> {
    loop {
        if token.is_cancelled() {
            return Acquire::Failed(CallFailure::Interrupted);
        }
        match mutex.try_lock() {
            Ok(guard) => return Acquire::Locked(guard),
            Err(TryLockError::Poisoned(poisoned)) => {
                return Acquire::Locked(poisoned.into_inner())
            }
            Err(TryLockError::WouldBlock) => {}
        }
        if Instant::now() >= deadline {
            return Acquire::Failed(CallFailure::TimedOut);
        }
        std::thread::sleep(RETRY_PAUSE);
    }
}

/// Runs `call` until it succeeds, fails, passes `deadline` or `token` is
/// cancelled. Busy and locked answers are retried; `call` must therefore be
/// safe to repeat, which holds for single autocommit statements.
pub(crate) fn run_bounded<T, F>(
    conn: &Connection,
    deadline: Instant,
    token: &CancelToken,
    mut call: F,
) -> Result<T, CallFailure>
where
    F: FnMut(&Connection) -> rusqlite::Result<T>,
{
    // Busy waits are done here so they stay cancellable.
    conn.busy_timeout(Duration::ZERO).map_err(CallFailure::Sqlite)?;
    let flag = Arc::clone(&token.cancelled);
    conn.progress_handler(
        PROGRESS_CHECK_STEPS,
        Some(move || flag.load(Ordering::SeqCst) || Instant::now() >= deadline),
    );

    let result = loop {
        if token.is_cancelled() {
            break Err(CallFailure::Interrupted);
        }
        if Instant::now() >= deadline {
            break Err(CallFailure::TimedOut);
        }
        match call(conn) {
            Ok(value) => break Ok(value),
            Err(err) if is_busy(&err) => std::thread::sleep(RETRY_PAUSE),
            Err(err) => break Err(classify(err, token)),
        }
    };
    conn.progress_handler(0, None::<fn() -> bool>);
    result
}

fn error_code(err: &rusqlite::Error) -> Option<ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(failure, _) => Some(failure.code),
        _ => None,
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        error_code(err),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn classify(err: rusqlite::Error, token: &CancelToken) -> CallFailure {
    match error_code(&err) {
        Some(ErrorCode::OperationInterrupted) if token.is_cancelled() => {
            CallFailure::Interrupted
        }
        Some(ErrorCode::OperationInterrupted) => CallFailure::TimedOut,
        _ => CallFailure::Sqlite(err),
    }
}

#[cfg(test)]
mod tests {
    use super::{lock_until, run_bounded, Acquire, CallFailure, CancelToken};
    use rusqlite::Connection;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    const SLOW_QUERY: &str = "WITH RECURSIVE spin(n) AS (
        SELECT 1 UNION ALL SELECT n + 1 FROM spin
    ) SELECT count(*) FROM spin";
    const COUNTING_QUERY: &str = "WITH RECURSIVE spin(n) AS (
        SELECT 1 UNION ALL SELECT n + 1 FROM spin WHERE n < 10000
    ) SELECT count(*) FROM spin";

    fn within(timeout: Duration) -> Instant {
        Instant::now() + timeout
    }

    #[test]
    fn fast_calls_succeed() {
        let conn = Connection::open_in_memory().unwrap();
        let token = CancelToken::new();
        let value: i64 = run_bounded(&conn, within(Duration::from_secs(1)), &token, |conn| {
            conn.query_row("SELECT 41 + 1", [], |row| row.get(0))
        })
        .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn runaway_statement_hits_deadline() {
        let conn = Connection::open_in_memory().unwrap();
        let token = CancelToken::new();
        let err = run_bounded(&conn, within(Duration::from_millis(50)), &token, |conn| {
            conn.query_row(SLOW_QUERY, [], |row| row.get::<_, i64>(0))
        })
        .unwrap_err();
        assert!(matches!(err, CallFailure::TimedOut));

        // Deadline must not leak into the next call.
        let value: i64 = run_bounded(&conn, within(Duration::from_secs(1)), &token, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get(0))
        })
        .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn cancel_interrupts_running_statement() {
        let conn = Connection::open_in_memory().unwrap();
        let token = CancelToken::new();
        let remote = token.clone();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });
        let err = run_bounded(&conn, within(Duration::from_secs(30)), &token, |conn| {
            conn.query_row(SLOW_QUERY, [], |row| row.get::<_, i64>(0))
        })
        .unwrap_err();
        canceller.join().unwrap();

        assert!(matches!(err, CallFailure::Interrupted));
    }

    #[test]
    fn cancelled_token_only_stops_its_own_calls() {
        let conn = Connection::open_in_memory().unwrap();
        let cancelled = CancelToken::new();
        cancelled.cancel();

        let err = run_bounded(&conn, within(Duration::from_secs(1)), &cancelled, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        })
        .unwrap_err();
        assert!(matches!(err, CallFailure::Interrupted));

        let other = CancelToken::new();
        let value: i64 = run_bounded(&conn, within(Duration::from_secs(5)), &other, |conn| {
            conn.query_row(COUNTING_QUERY, [], |row| row.get(0))
        })
        .unwrap();
        assert_eq!(value, 10_000);
    }

    #[test]
    fn lock_wait_respects_deadline_and_cancel() {
        let mutex = Mutex::new(());
        let _held = mutex.lock().unwrap();

        let started = Instant::now();
        let patient = CancelToken::new();
        let timed_out = lock_until(&mutex, within(Duration::from_millis(100)), &patient);
        assert!(matches!(timed_out, Acquire::Failed(CallFailure::TimedOut)));
        assert!(started.elapsed() < Duration::from_secs(2));

        let token = CancelToken::new();
        token.cancel();
        let cancelled = lock_until(&mutex, within(Duration::from_secs(30)), &token);
        assert!(matches!(cancelled, Acquire::Failed(CallFailure::Interrupted)));
    }
}
