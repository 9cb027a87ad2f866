//! Connection pool wrapper with saturation gauges.
//!
//! Wraps a single shared `sqlx` pool and publishes `db.pool.total`,
//! `db.pool.used`, and `db.pool.waiting` on every acquire, release, and
//! enqueue event. Connections are handed out as [`PooledConnection`] guards
//! whose `release` consumes the handle, so one borrow can only be returned
//! once; dropping a guard returns the connection as well, which keeps error
//! paths from leaking pool slots.

use crate::config::{DbConfig, PoolSettings};
use crate::error::{DbError, DbResult};
use crate::metrics::{
    MetricsSink, Unit, GAUGE_POOL_TOTAL, GAUGE_POOL_USED, GAUGE_POOL_WAITING,
};
use crate::sql::{SingleUse, Sql};
use serde::Serialize;
use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, AnyPool};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

static DRIVERS: Once = Once::new();

/// SQL dialect of the connected backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    MySql,
    Postgres,
    Sqlite,
}

impl Dialect {
    fn from_scheme(scheme: &str) -> DbResult<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Dialect::MySql),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(DbError::config(format!(
                "Unsupported database scheme '{other}' (expected mysql, postgres, or sqlite)"
            ))),
        }
    }

    /// The statement that opens an explicit transaction on this backend.
    pub(crate) fn begin_statement(self) -> &'static str {
        match self {
            Dialect::Sqlite => "BEGIN",
            Dialect::MySql | Dialect::Postgres => "START TRANSACTION",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        };
        write!(f, "{name}")
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections owned by the pool
    pub total: u32,
    /// Connections currently checked out
    pub used: u32,
    /// Callers waiting for a free connection
    pub waiting: usize,
    /// Checkouts since the pool was created
    pub acquired: u64,
    /// Returns since the pool was created
    pub released: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} connections in use ({} waiting)",
            self.used, self.total, self.waiting
        )
    }
}

struct PoolShared {
    pool: AnyPool,
    dialect: Dialect,
    hold_timeout: Duration,
    acquire_timeout: Duration,
    trace_sql: bool,
    sink: Arc<dyn MetricsSink>,
    waiting: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl PoolShared {
    fn stats(&self) -> PoolStats {
        let acquired = self.acquired.load(Ordering::SeqCst);
        let released = self.released.load(Ordering::SeqCst);
        PoolStats {
            total: self.pool.size(),
            used: acquired.saturating_sub(released) as u32,
            waiting: self.waiting.load(Ordering::SeqCst),
            acquired,
            released,
        }
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        self.gauge(GAUGE_POOL_TOTAL, stats.total.into());
        self.gauge(GAUGE_POOL_USED, stats.used.into());
        self.gauge(GAUGE_POOL_WAITING, stats.waiting as f64);
    }

    fn gauge(&self, name: &str, value: f64) {
        if let Err(e) = self.sink.gauge(name, value, Unit::Count) {
            warn!(gauge = name, error = %e, "Metrics sink rejected gauge");
        }
    }
}

/// Decrements the waiting counter on every exit from an acquire attempt.
struct WaitGuard<'a> {
    shared: &'a PoolShared,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.shared.waiting.fetch_sub(1, Ordering::SeqCst);
        self.shared.publish_gauges();
    }
}

/// Shared handle to the connection pool. Cheap to clone.
#[derive(Clone)]
pub struct DbPool {
    shared: Arc<PoolShared>,
}

impl DbPool {
    /// Connect to a MySQL-compatible server described by a [`DbConfig`].
    pub async fn connect(config: &DbConfig, sink: Arc<dyn MetricsSink>) -> DbResult<Self> {
        let url = config.connect_url()?;
        Self::build(url, &config.pool, config.trace_sql, sink).await
    }

    /// Connect to any supported backend by URL
    /// (`mysql://`, `postgres://`, `sqlite:`).
    pub async fn connect_url(
        url: &str,
        settings: &PoolSettings,
        trace_sql: bool,
        sink: Arc<dyn MetricsSink>,
    ) -> DbResult<Self> {
        let parsed =
            Url::parse(url).map_err(|e| DbError::config(format!("Invalid database URL: {e}")))?;
        Self::build(parsed, settings, trace_sql, sink).await
    }

    async fn build(
        url: Url,
        settings: &PoolSettings,
        trace_sql: bool,
        sink: Arc<dyn MetricsSink>,
    ) -> DbResult<Self> {
        settings.validate().map_err(DbError::config)?;
        let dialect = Dialect::from_scheme(url.scheme())?;
        DRIVERS.call_once(sqlx::any::install_default_drivers);

        let acquire_timeout = Duration::from_secs(settings.acquire_timeout_or_default());
        let pool = AnyPoolOptions::new()
            .min_connections(settings.min_connections_or_default())
            .max_connections(settings.max_connections_or_default())
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(settings.idle_timeout_or_default()))
            .test_before_acquire(settings.test_before_acquire_or_default())
            .connect(url.as_str())
            .await
            .map_err(|e| DbError::connection(format!("Failed to connect: {e}")))?;

        let db = Self {
            shared: Arc::new(PoolShared {
                pool,
                dialect,
                hold_timeout: settings.hold_timeout(),
                acquire_timeout,
                trace_sql,
                sink,
                waiting: AtomicUsize::new(0),
                acquired: AtomicU64::new(0),
                released: AtomicU64::new(0),
            }),
        };

        // a pool that cannot answer `select 1` must not serve traffic
        if let Err(e) = db.exec("select 1").first().await {
            error!(error = %e, "Database connectivity check failed");
            db.close().await;
            return Err(e);
        }

        info!(
            dialect = %dialect,
            max_connections = settings.max_connections_or_default(),
            hold_timeout_ms = settings.hold_timeout().as_millis() as u64,
            "Database pool ready"
        );
        Ok(db)
    }

    /// Check out a connection, waiting if the pool is saturated.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let shared = &self.shared;
        shared.waiting.fetch_add(1, Ordering::SeqCst);
        shared.publish_gauges();

        let acquired = {
            let _wait = WaitGuard { shared };
            shared.pool.acquire().await
        };

        match acquired {
            Ok(conn) => {
                shared.acquired.fetch_add(1, Ordering::SeqCst);
                shared.publish_gauges();
                Ok(PooledConnection {
                    conn: Some(conn),
                    shared: Arc::clone(shared),
                })
            }
            Err(sqlx::Error::PoolTimedOut) => Err(DbError::pool_exhausted(format!(
                "No connection became free within {:?}",
                shared.acquire_timeout
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Build a statement that runs on its own short-lived connection.
    ///
    /// The connection is acquired when the statement executes and returned
    /// as soon as it completes, whatever the outcome.
    pub fn exec(&self, statement: impl Into<String>) -> Sql<SingleUse> {
        Sql::new(
            statement,
            SingleUse::new(self.clone()),
            self.shared.trace_sql,
        )
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    /// Log the pool counters at info level and return them.
    pub fn dump_stats(&self) -> PoolStats {
        let stats = self.stats();
        info!(
            total = stats.total,
            used = stats.used,
            waiting = stats.waiting,
            acquired = stats.acquired,
            released = stats.released,
            "Pool statistics"
        );
        stats
    }

    /// Close the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.shared.pool.close().await;
        info!("Database pool closed");
    }

    /// SQL dialect of the connected backend.
    pub fn dialect(&self) -> Dialect {
        self.shared.dialect
    }

    pub(crate) fn trace_sql(&self) -> bool {
        self.shared.trace_sql
    }

    pub(crate) fn hold_timeout(&self) -> Duration {
        self.shared.hold_timeout
    }
}

impl fmt::Debug for DbPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbPool")
            .field("dialect", &self.shared.dialect)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A connection checked out from the pool.
///
/// `release` consumes the handle, making a double return impossible to
/// express. A handle that goes out of scope without an explicit release
/// still returns its connection and updates the gauges.
pub struct PooledConnection {
    conn: Option<PoolConnection<Any>>,
    shared: Arc<PoolShared>,
}

impl PooledConnection {
    /// Access the underlying driver connection.
    pub(crate) fn raw(&mut self) -> DbResult<&mut AnyConnection> {
        match self.conn.as_mut() {
            Some(conn) => Ok(&mut **conn),
            None => Err(DbError::internal(
                "Connection handle already returned to the pool",
            )),
        }
    }

    /// Return the connection to the pool.
    pub fn release(mut self) {
        self.put_back();
    }

    fn put_back(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            self.shared.released.fetch_add(1, Ordering::SeqCst);
            self.shared.publish_gauges();
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.put_back();
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("live", &self.conn.is_some())
            .finish()
    }
}
