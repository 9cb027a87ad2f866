//! Transactional SQL access layer.
//!
//! Wraps a shared `sqlx` connection pool (MySQL, PostgreSQL, SQLite) with
//! saturation gauges, defers statement execution behind a connection
//! supplier, scopes at most one connection to each unit of work, and
//! reclaims connections held past a timeout by rolling back and forcing a
//! release.
//!
//! Typical use goes through [`transactional`], which hands the request
//! handler a [`DbContext`] and settles the unit of work on every exit path;
//! one-off statements outside a request go through [`DbPool::exec`].

pub mod config;
pub mod context;
pub mod error;
mod guard;
pub mod metrics;
pub mod middleware;
pub mod pool;
pub mod row;
pub mod sql;
pub mod value;

pub use config::{DbConfig, PoolSettings};
pub use context::{DbContext, TxState};
pub use error::{DbError, DbResult};
pub use metrics::{LogSink, MetricsError, MetricsSink, NullSink, Unit};
pub use middleware::transactional;
pub use pool::{DbPool, Dialect, PoolStats, PooledConnection};
pub use row::Row;
pub use sql::{ConnectionSupplier, Sql, SingleUse, UnitScoped};
pub use value::Value;
