//! Connection pool creation, checkout, and statistics.
//!
//! The pool keeps at most `pool_size` idle connections to a single SQLite
//! file. It starts with one connection and grows lazily: a checkout that finds
//! the idle set empty opens a new connection while the pool is under
//! capacity, and otherwise waits up to `checkout_timeout` for one to be
//! returned. Under the default [`OverflowPolicy::Elastic`] a checkout that
//! times out opens an extra connection instead of failing.

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Idle connections older than this are probed with `SELECT 1` before reuse.
pub const HEALTH_CHECK_IDLE_THRESHOLD: Duration = Duration::from_secs(60);

/// What a checkout does when no connection frees up within the timeout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Open an extra connection on demand. The pool may temporarily hold more
    /// than `pool_size` open connections.
    #[default]
    Elastic,
    /// Fail the checkout with [`PoolError::Timeout`].
    Strict,
}

/// Runtime tunables for the connection pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolConfig {
    /// Maximum number of idle connections retained by the pool.
    pub pool_size: usize,

    /// How long a checkout waits for an idle connection.
    pub checkout_timeout: Duration,

    /// Idle connections older than this are discarded and replaced.
    pub max_idle_time: Duration,

    /// Idle connections older than this are probed before reuse.
    pub health_check_idle_threshold: Duration,

    /// Waiting longer than this for an idle connection counts as a wait in
    /// [`PoolStats::total_waits`].
    pub wait_threshold: Duration,

    /// SQLite busy handler timeout for every created connection.
    pub busy_timeout: Duration,

    /// Behavior when the checkout timeout expires.
    pub overflow: OverflowPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            checkout_timeout: Duration::from_secs(30),
            max_idle_time: Duration::from_secs(300),
            health_check_idle_threshold: HEALTH_CHECK_IDLE_THRESHOLD,
            wait_threshold: Duration::from_millis(100),
            busy_timeout: Duration::from_secs(30),
            overflow: OverflowPolicy::Elastic,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), PoolError> {
        if self.pool_size == 0 {
            return Err(PoolError::InvalidConfig(
                "pool_size must be at least 1".to_string(),
            ));
        }
        if self.checkout_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "checkout_timeout must be positive".to_string(),
            ));
        }
        if self.max_idle_time.is_zero() {
            return Err(PoolError::InvalidConfig(
                "max_idle_time must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Errors that can occur when creating or using the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool configuration was rejected.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Opening or initializing a new connection failed.
    #[error("failed to open database connection: {0}")]
    Connect(#[source] rusqlite::Error),

    /// No connection became available in time under [`OverflowPolicy::Strict`].
    #[error("timed out after {0:?} waiting for a database connection")]
    Timeout(Duration),

    /// The pool has been shut down with [`ConnectionPool::close_all`].
    #[error("connection pool is closed")]
    Closed,

    /// The scoped checkout could not begin its transaction.
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] rusqlite::Error),

    /// The scoped checkout could not commit its transaction.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] rusqlite::Error),
}

/// A point-in-time snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStats {
    /// Configured idle capacity.
    pub pool_size: usize,
    /// Connections currently idle in the pool.
    pub available: usize,
    /// Connections currently checked out.
    pub active: u64,
    /// Connections ever created by this pool.
    pub created: u64,
    /// Checkout attempts.
    pub total_requests: u64,
    /// Checkouts that waited measurably or fell back to on-demand creation.
    pub total_waits: u64,
    /// `total_waits / max(total_requests, 1)`.
    pub wait_ratio: f64,
}

/// Applies the per-connection settings every pooled connection shares:
/// WAL journaling, foreign-key enforcement, and the busy timeout.
///
/// In-memory databases report `memory` as their journal mode, which is
/// accepted.
///
/// # Errors
///
/// Returns the underlying SQLite error if a pragma fails or WAL mode is
/// refused.
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    let journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
    if journal_mode != "wal" && journal_mode != "memory" {
        return Err(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
            Some(format!(
                "failed to set WAL journal mode, got: {}",
                journal_mode
            )),
        ));
    }
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(busy_timeout)
}

fn connection_manager(db_path: &Path, busy_timeout: Duration) -> SqliteConnectionManager {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| configure_connection(conn, busy_timeout))
}

struct IdleConnection {
    conn: Connection,
    last_used: Instant,
}

/// Idle set plus the number of open connections the pool accounts for
/// (idle and checked out). Both change together under one lock.
struct Slots {
    idle: VecDeque<IdleConnection>,
    open: usize,
    closed: bool,
}

#[derive(Default)]
struct Counters {
    created: u64,
    active: u64,
    total_requests: u64,
    total_waits: u64,
}

enum Acquire {
    Idle(IdleConnection),
    Grow,
    TimedOut,
}

struct Shared {
    manager: SqliteConnectionManager,
    config: PoolConfig,
    slots: Mutex<Slots>,
    available: Condvar,
    counters: Mutex<Counters>,
}

impl Shared {
    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connect(&self) -> Result<Connection, PoolError> {
        let conn = self.manager.connect().map_err(PoolError::Connect)?;
        self.lock_counters().created += 1;
        Ok(conn)
    }

    /// Waits for an idle connection or a free slot to grow into.
    fn acquire(&self) -> Result<Acquire, PoolError> {
        let pool_size = self.config.pool_size;
        let slots = self.lock_slots();
        let (mut slots, _) = self
            .available
            .wait_timeout_while(slots, self.config.checkout_timeout, |s| {
                !s.closed && s.idle.is_empty() && s.open >= pool_size
            })
            .unwrap_or_else(PoisonError::into_inner);

        if slots.closed {
            return Err(PoolError::Closed);
        }
        if let Some(idle) = slots.idle.pop_front() {
            return Ok(Acquire::Idle(idle));
        }
        if slots.open < pool_size {
            slots.open += 1;
            return Ok(Acquire::Grow);
        }
        Ok(Acquire::TimedOut)
    }

    /// Opens a connection for a slot already counted in `open`, giving the
    /// slot back if the open fails.
    fn connect_reserved(&self) -> Result<Connection, PoolError> {
        self.connect().inspect_err(|_| self.forget_one())
    }

    fn reserve_overflow(&self) {
        self.lock_slots().open += 1;
    }

    fn forget_one(&self) {
        {
            let mut slots = self.lock_slots();
            slots.open = slots.open.saturating_sub(1);
        }
        self.available.notify_one();
    }

    /// Discards stale connections and probes long-idle ones, replacing either
    /// with a fresh connection.
    fn refresh(&self, idle: IdleConnection) -> Result<Connection, PoolError> {
        let idle_for = idle.last_used.elapsed();

        if idle_for > self.config.max_idle_time {
            tracing::debug!(
                idle_ms = idle_for.as_millis() as u64,
                "discarding stale connection"
            );
            close_quietly(idle.conn);
            return self.connect_reserved();
        }

        if idle_for > self.config.health_check_idle_threshold {
            if let Err(e) = probe(&idle.conn) {
                tracing::debug!(error = %e, "health probe failed, replacing connection");
                close_quietly(idle.conn);
                return self.connect_reserved();
            }
        }

        Ok(idle.conn)
    }

    /// Returns a connection to the idle set, or closes it when the set is
    /// full or the pool has been shut down.
    fn release(&self, conn: Connection) {
        let rejected = {
            let mut slots = self.lock_slots();
            if slots.closed || slots.idle.len() >= self.config.pool_size {
                slots.open = slots.open.saturating_sub(1);
                Some(conn)
            } else {
                slots.idle.push_back(IdleConnection {
                    conn,
                    last_used: Instant::now(),
                });
                None
            }
        };
        self.available.notify_one();

        if let Some(conn) = rejected {
            tracing::debug!("idle pool full or closed, closing returned connection");
            close_quietly(conn);
        }

        let mut counters = self.lock_counters();
        counters.active = counters.active.saturating_sub(1);
    }
}

fn probe(conn: &Connection) -> rusqlite::Result<()> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
        .map(|_| ())
}

fn close_quietly(conn: Connection) {
    if let Err((_, e)) = conn.close() {
        tracing::warn!(error = %e, "failed to close database connection");
    }
}

/// A thread-safe pool of SQLite connections to one database file.
///
/// Cloning is cheap; clones share the same connections and statistics.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Creates a pool for `db_path` and opens its first connection.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` for a zero `pool_size`,
    /// `checkout_timeout`, or `max_idle_time`, and `PoolError::Connect` if the first connection cannot be opened.
    pub fn new(db_path: impl AsRef<Path>, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let db_path = db_path.as_ref();

        let shared = Arc::new(Shared {
            manager: connection_manager(db_path, config.busy_timeout),
            config,
            slots: Mutex::new(Slots {
                idle: VecDeque::with_capacity(config.pool_size),
                open: 0,
                closed: false,
            }),
            available: Condvar::new(),
            counters: Mutex::new(Counters::default()),
        });

        let conn = shared.connect()?;
        {
            let mut slots = shared.lock_slots();
            slots.open = 1;
            slots.idle.push_back(IdleConnection {
                conn,
                last_used: Instant::now(),
            });
        }

        tracing::info!(
            path = %db_path.display(),
            pool_size = config.pool_size,
            "created database connection pool"
        );

        Ok(Self { shared })
    }

    /// Returns the configuration the pool was created with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Checks out a connection without opening a transaction.
    ///
    /// The connection returns to the pool when the guard is dropped. Any
    /// transaction still open at that point is rolled back first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Connect` if a new connection had to be opened and
    /// that failed, `PoolError::Closed` after [`close_all`](Self::close_all),
    /// and `PoolError::Timeout` under [`OverflowPolicy::Strict`].
    pub fn get(&self) -> Result<PooledConnection, PoolError> {
        let shared = &self.shared;
        let config = &shared.config;
        let started = Instant::now();
        shared.lock_counters().total_requests += 1;

        let (conn, waited) = match shared.acquire()? {
            Acquire::Idle(idle) => {
                let waited = started.elapsed() > config.wait_threshold;
                (shared.refresh(idle)?, waited)
            }
            Acquire::Grow => {
                let waited = started.elapsed() > config.wait_threshold;
                (shared.connect_reserved()?, waited)
            }
            Acquire::TimedOut => match config.overflow {
                OverflowPolicy::Elastic => {
                    tracing::warn!(
                        timeout_ms = config.checkout_timeout.as_millis() as u64,
                        "no idle connection available, opening one on demand"
                    );
                    shared.reserve_overflow();
                    (shared.connect_reserved()?, true)
                }
                OverflowPolicy::Strict => {
                    shared.lock_counters().total_waits += 1;
                    return Err(PoolError::Timeout(config.checkout_timeout));
                }
            },
        };

        {
            let mut counters = shared.lock_counters();
            counters.active += 1;
            if waited {
                counters.total_waits += 1;
            }
        }

        Ok(PooledConnection {
            shared: Arc::clone(shared),
            conn: Some(conn),
        })
    }

    /// Runs `work` inside a transaction on a checked-out connection.
    ///
    /// The transaction commits when `work` returns `Ok` and rolls back when it
    /// returns `Err` or panics; the caller's error is returned unchanged. The
    /// connection goes back to the pool on every path.
    ///
    /// # Errors
    ///
    /// Returns the error from `work`, or a [`PoolError`] converted into `E`
    /// if the checkout, `BEGIN`, or `COMMIT` failed.
    pub fn checkout<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<PoolError>,
    {
        let mut conn = self.get()?;
        let tx = conn.transaction().map_err(PoolError::Begin)?;

        match work(&tx) {
            Ok(value) => {
                tx.commit().map_err(PoolError::Commit)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(e) = tx.rollback() {
                    tracing::debug!(error = %e, "rollback after failed unit of work also failed");
                }
                Err(err)
            }
        }
    }

    /// Closes every idle connection and marks the pool closed.
    ///
    /// Connections that are checked out stay usable; each one is closed when
    /// its guard is dropped. Further checkouts fail with `PoolError::Closed`.
    /// Returns the number of idle connections closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<IdleConnection> = {
            let mut slots = self.shared.lock_slots();
            slots.closed = true;
            let drained: Vec<_> = slots.idle.drain(..).collect();
            slots.open = slots.open.saturating_sub(drained.len());
            drained
        };
        self.shared.available.notify_all();

        let count = drained.len();
        for idle in drained {
            close_quietly(idle.conn);
        }

        tracing::info!(closed = count, "closed database connection pool");
        count
    }

    /// Returns a snapshot of pool usage counters.
    pub fn stats(&self) -> PoolStats {
        let available = self.shared.lock_slots().idle.len();
        let counters = self.shared.lock_counters();

        PoolStats {
            pool_size: self.shared.config.pool_size,
            available,
            active: counters.active,
            created: counters.created,
            total_requests: counters.total_requests,
            total_waits: counters.total_waits,
            wait_ratio: counters.total_waits as f64 / counters.total_requests.max(1) as f64,
        }
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dereferences to [`rusqlite::Connection`]. Dropping the guard returns the
/// connection to the pool.
pub struct PooledConnection {
    shared: Arc<Shared>,
    conn: Option<Connection>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `drop` takes the connection out.
        self.conn.as_ref().expect("connection is present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !conn.is_autocommit() {
                if let Err(e) = conn.execute_batch("ROLLBACK;") {
                    tracing::debug!(error = %e, "failed to roll back abandoned transaction");
                }
            }
            self.shared.release(conn);
        }
    }
}
