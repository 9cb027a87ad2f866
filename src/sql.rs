//! Deferred statement builder.
//!
//! A [`Sql`] value is inert: building and binding never touch the pool.
//! Execution resolves a connection through the statement's
//! [`ConnectionSupplier`] and runs exactly one statement on it. The two
//! strategies differ only in where that connection comes from and when it
//! goes back:
//!
//! - [`SingleUse`] acquires from the pool and releases as soon as the
//!   statement completes, success or failure.
//! - [`UnitScoped`] runs on the connection held by one unit of work,
//!   attaching a connection to the unit on first use.

use crate::context::{TxState, UnitInner};
use crate::error::{DbError, DbResult};
use crate::guard;
use crate::pool::{DbPool, PooledConnection};
use crate::row::{row_to_map, Row};
use crate::value::{bind_value, Value};
use futures_util::TryStreamExt;
use sqlx::any::AnyRow;
use sqlx::AnyConnection;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// Resolves the connection a deferred statement should run on.
pub trait ConnectionSupplier: Send + Sync {
    fn lease(&self) -> impl Future<Output = DbResult<ConnectionLease>> + Send;
}

/// Exclusive access to a connection for the duration of one statement.
pub struct ConnectionLease {
    inner: LeaseInner,
}

enum LeaseInner {
    Single(PooledConnection),
    Scoped(OwnedMutexGuard<UnitInner>),
}

impl ConnectionLease {
    fn single(conn: PooledConnection) -> Self {
        Self {
            inner: LeaseInner::Single(conn),
        }
    }

    fn scoped(guard: OwnedMutexGuard<UnitInner>) -> Self {
        Self {
            inner: LeaseInner::Scoped(guard),
        }
    }

    fn connection(&mut self) -> DbResult<&mut AnyConnection> {
        match &mut self.inner {
            LeaseInner::Single(conn) => conn.raw(),
            LeaseInner::Scoped(guard) => {
                let state = guard.state;
                match guard.conn.as_mut() {
                    Some(conn) => conn.raw(),
                    None => Err(DbError::unit_closed(state)),
                }
            }
        }
    }

    fn settle(self) {
        match self.inner {
            LeaseInner::Single(conn) => conn.release(),
            LeaseInner::Scoped(guard) => drop(guard),
        }
    }
}

/// Acquire a fresh connection per statement, release it right after.
pub struct SingleUse {
    pool: DbPool,
}

impl SingleUse {
    pub(crate) fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl ConnectionSupplier for SingleUse {
    async fn lease(&self) -> DbResult<ConnectionLease> {
        let conn = self.pool.acquire().await?;
        Ok(ConnectionLease::single(conn))
    }
}

/// Run on the connection scoped to one unit of work.
///
/// The first statement through this supplier attaches a connection to the
/// unit and arms its hold-timeout guard. Once the unit reaches a terminal
/// state, every further lease fails with [`DbError::UnitClosed`].
pub struct UnitScoped {
    pool: DbPool,
    unit: Arc<Mutex<UnitInner>>,
}

impl UnitScoped {
    pub(crate) fn new(pool: DbPool, unit: Arc<Mutex<UnitInner>>) -> Self {
        Self { pool, unit }
    }
}

impl ConnectionSupplier for UnitScoped {
    async fn lease(&self) -> DbResult<ConnectionLease> {
        let mut unit = Arc::clone(&self.unit).lock_owned().await;
        if unit.state.is_terminal() {
            return Err(DbError::unit_closed(unit.state));
        }
        if unit.conn.is_none() {
            let conn = self.pool.acquire().await?;
            unit.attach(conn, TxState::Connected);
            guard::arm(
                &mut unit,
                Arc::downgrade(&self.unit),
                self.pool.hold_timeout(),
            );
            debug!(unit = %unit.id, "Connection attached to unit of work");
        }
        Ok(ConnectionLease::scoped(unit))
    }
}

/// A deferred SQL statement.
///
/// Construction and binding are pure; nothing touches the database until
/// [`first`](Sql::first), [`all`](Sql::all), or [`update`](Sql::update)
/// runs the statement.
pub struct Sql<S> {
    statement: String,
    params: Vec<Value>,
    supplier: S,
    trace: bool,
}

impl<S: ConnectionSupplier> Sql<S> {
    pub(crate) fn new(statement: impl Into<String>, supplier: S, trace: bool) -> Self {
        Self {
            statement: statement.into(),
            params: Vec::new(),
            supplier,
            trace,
        }
    }

    /// Bind the next positional parameter.
    ///
    /// Placeholder syntax follows the connected backend: `?` for MySQL and
    /// SQLite, `$1`..`$n` for PostgreSQL.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Execute and return the first row, if any.
    pub async fn first(self) -> DbResult<Option<Row>> {
        let Self {
            statement,
            params,
            supplier,
            trace,
        } = self;
        let mut lease = supplier.lease().await?;
        let fetched = {
            let conn = lease.connection()?;
            let mut query = sqlx::query(&statement);
            for value in &params {
                query = bind_value(query, value);
            }
            query.fetch_optional(conn).await
        };
        lease.settle();
        let row = fetched?;
        if trace {
            info!(sql = %statement, found = row.is_some(), "Statement executed");
        } else {
            debug!(sql = %statement, found = row.is_some(), "Statement executed");
        }
        Ok(row.as_ref().map(row_to_map))
    }

    /// Execute and return every row.
    pub async fn all(self) -> DbResult<Vec<Row>> {
        let Self {
            statement,
            params,
            supplier,
            trace,
        } = self;
        let mut lease = supplier.lease().await?;
        let fetched: Result<Vec<AnyRow>, sqlx::Error> = {
            let conn = lease.connection()?;
            let mut query = sqlx::query(&statement);
            for value in &params {
                query = bind_value(query, value);
            }
            query.fetch(conn).try_collect().await
        };
        lease.settle();
        let rows = fetched?;
        if trace {
            info!(sql = %statement, row_count = rows.len(), "Statement executed");
        } else {
            debug!(sql = %statement, row_count = rows.len(), "Statement executed");
        }
        Ok(rows.iter().map(row_to_map).collect())
    }

    /// Execute and return the number of affected rows.
    pub async fn update(self) -> DbResult<u64> {
        let Self {
            statement,
            params,
            supplier,
            trace,
        } = self;
        let mut lease = supplier.lease().await?;
        let executed = {
            let conn = lease.connection()?;
            let mut query = sqlx::query(&statement);
            for value in &params {
                query = bind_value(query, value);
            }
            query.execute(conn).await
        };
        lease.settle();
        let rows_affected = executed?.rows_affected();
        if trace {
            info!(sql = %statement, rows_affected, "Statement executed");
        } else {
            debug!(sql = %statement, rows_affected, "Statement executed");
        }
        Ok(rows_affected)
    }
}
