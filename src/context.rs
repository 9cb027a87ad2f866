//! Per-request transaction context.
//!
//! A [`DbContext`] scopes at most one pooled connection to one unit of work
//! (typically one request). Statements built through [`DbContext::sql`] run
//! on that connection, attaching it lazily on first use; [`DbContext::begin`]
//! opens an explicit transaction on a fresh connection. Every way a held
//! connection can be let go funnels through one close path, so release and
//! guard cancellation happen exactly once no matter who settles the unit
//! first.

use crate::error::DbResult;
use crate::guard;
use crate::pool::{DbPool, Dialect, PooledConnection};
use crate::sql::{Sql, UnitScoped};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of a unit of work.
///
/// `Committed`, `RolledBack`, and `TimedOut` are terminal: a unit that
/// reached one of them no longer holds a connection and rejects further
/// statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// No connection attached yet
    Idle,
    /// Holding a connection in autocommit mode
    Connected,
    /// Holding a connection with an open transaction
    InTransaction,
    Committed,
    RolledBack,
    TimedOut,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::TimedOut
        )
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxState::Idle => "idle",
            TxState::Connected => "connected",
            TxState::InTransaction => "in_transaction",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
            TxState::TimedOut => "timed_out",
        };
        write!(f, "{name}")
    }
}

/// How a connection-holding period ends.
pub(crate) enum HoldOutcome {
    /// Explicit commit; a failed COMMIT still releases and reports the error
    Commit,
    /// Explicit rollback
    Rollback,
    /// End of the unit of work without an explicit verdict
    Abandon,
    /// The hold-timeout guard fired
    Timeout,
}

/// Mutable state behind the context lock.
///
/// Invariant: `conn` is `Some` exactly while `state` is `Connected` or
/// `InTransaction`, and a reaper task is armed for exactly that span.
pub(crate) struct UnitInner {
    pub(crate) conn: Option<PooledConnection>,
    pub(crate) state: TxState,
    /// Bumped on every arm and settle; a reaper only acts if the epoch it
    /// was armed with is still current
    pub(crate) epoch: u64,
    pub(crate) reaper: Option<JoinHandle<()>>,
    pub(crate) started: Option<Instant>,
    pub(crate) id: Arc<str>,
    dialect: Dialect,
}

impl UnitInner {
    fn new(id: Arc<str>, dialect: Dialect) -> Self {
        Self {
            conn: None,
            state: TxState::Idle,
            epoch: 0,
            reaper: None,
            started: None,
            id,
            dialect,
        }
    }

    /// Install a freshly acquired connection and start the hold clock.
    pub(crate) fn attach(&mut self, conn: PooledConnection, state: TxState) {
        self.conn = Some(conn);
        self.started = Some(Instant::now());
        self.state = state;
    }

    fn held_ms(&self) -> u64 {
        self.started
            .map(|s| s.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    /// The one place a held connection is let go.
    ///
    /// Takes the connection, cancels the guard, optionally issues the
    /// closing statement, releases, and records the terminal state. With no
    /// connection held this is a no-op, which is what makes the settle race
    /// between callers and the guard safe: the loser finds nothing to do.
    pub(crate) async fn close_hold(&mut self, outcome: HoldOutcome) -> DbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        guard::disarm(self);
        let was_tx = self.state == TxState::InTransaction;
        let held_ms = self.held_ms();
        self.started = None;

        // COMMIT and ROLLBACK outside a transaction are errors on SQLite
        let bare_sqlite = !was_tx && self.dialect == Dialect::Sqlite;
        let closing = match outcome {
            HoldOutcome::Commit => (!bare_sqlite).then_some("COMMIT"),
            HoldOutcome::Rollback => (!bare_sqlite).then_some("ROLLBACK"),
            HoldOutcome::Abandon | HoldOutcome::Timeout => was_tx.then_some("ROLLBACK"),
        };
        let result = match closing {
            Some(statement) => run_statement(&mut conn, statement).await,
            None => Ok(()),
        };
        conn.release();

        match outcome {
            HoldOutcome::Commit => match result {
                Ok(()) => {
                    self.state = TxState::Committed;
                    info!(unit = %self.id, held_ms, "Transaction committed");
                    Ok(())
                }
                Err(e) => {
                    // the server aborts a transaction whose COMMIT failed
                    self.state = TxState::RolledBack;
                    warn!(unit = %self.id, held_ms, error = %e, "Commit failed; connection released");
                    Err(e)
                }
            },
            HoldOutcome::Rollback => {
                self.state = TxState::RolledBack;
                match result {
                    Ok(()) => {
                        info!(unit = %self.id, held_ms, "Transaction rolled back");
                        Ok(())
                    }
                    Err(e) => {
                        warn!(unit = %self.id, held_ms, error = %e, "Rollback failed; connection released");
                        Err(e)
                    }
                }
            }
            HoldOutcome::Abandon => {
                self.state = if was_tx {
                    TxState::RolledBack
                } else {
                    TxState::Committed
                };
                if let Err(e) = result {
                    error!(unit = %self.id, error = %e, "Rollback during cleanup failed; connection released anyway");
                }
                debug!(unit = %self.id, held_ms, in_transaction = was_tx, "Unit of work closed");
                Ok(())
            }
            HoldOutcome::Timeout => {
                self.state = TxState::TimedOut;
                if let Err(e) = result {
                    error!(unit = %self.id, error = %e, "Rollback on timeout failed; connection released anyway");
                }
                error!(
                    unit = %self.id,
                    held_ms,
                    in_transaction = was_tx,
                    "Connection held past the timeout; forcibly reclaimed"
                );
                Ok(())
            }
        }
    }
}

impl Drop for UnitInner {
    /// Salvage for a unit dropped while still holding a connection.
    ///
    /// Spawns the rollback and release onto the runtime, since `Drop` cannot
    /// await. Requires an active tokio runtime; during runtime shutdown the
    /// pool reclaims the connection when it closes.
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.take() {
            handle.abort();
        }
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let was_tx = self.state == TxState::InTransaction;
        let id = Arc::clone(&self.id);
        tokio::spawn(async move {
            if was_tx {
                if let Ok(raw) = conn.raw() {
                    if let Err(e) = sqlx::query("ROLLBACK").execute(raw).await {
                        error!(unit = %id, error = %e, "Rollback during drop cleanup failed");
                    }
                }
            }
            conn.release();
            warn!(unit = %id, "Unit of work dropped while holding a connection; released in background");
        });
    }
}

async fn run_statement(conn: &mut PooledConnection, statement: &str) -> DbResult<()> {
    let raw = conn.raw()?;
    sqlx::query(statement).execute(raw).await?;
    Ok(())
}

fn generate_unit_id() -> String {
    format!("uow_{}", uuid::Uuid::new_v4().simple())
}

/// Per-request facade over a single pooled connection and its transaction
/// state. Cheap to clone; clones share the same unit of work.
#[derive(Clone)]
pub struct DbContext {
    pool: DbPool,
    unit: Arc<Mutex<UnitInner>>,
    id: Arc<str>,
}

impl DbContext {
    pub fn new(pool: &DbPool) -> Self {
        let id: Arc<str> = generate_unit_id().into();
        Self {
            pool: pool.clone(),
            unit: Arc::new(Mutex::new(UnitInner::new(Arc::clone(&id), pool.dialect()))),
            id,
        }
    }

    /// Identifier of this unit of work, for log correlation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Build a statement that runs on this unit's connection.
    pub fn sql(&self, statement: impl Into<String>) -> Sql<UnitScoped> {
        Sql::new(
            statement,
            UnitScoped::new(self.pool.clone(), Arc::clone(&self.unit)),
            self.pool.trace_sql(),
        )
    }

    /// Open an explicit transaction on a fresh connection.
    ///
    /// Any connection already held by this unit is discarded first (rolled
    /// back if it was in a transaction, then released), so `begin` never
    /// reuses a leftover connection.
    pub async fn begin(&self) -> DbResult<()> {
        let mut unit = self.unit.lock().await;
        if unit.conn.is_some() {
            debug!(unit = %self.id, "begin: discarding previously held connection");
            let _ = unit.close_hold(HoldOutcome::Abandon).await;
        }

        let mut conn = self.pool.acquire().await?;
        if let Err(e) = run_statement(&mut conn, self.pool.dialect().begin_statement()).await {
            conn.release();
            unit.state = TxState::Idle;
            warn!(unit = %self.id, error = %e, "Failed to start transaction");
            return Err(e);
        }

        unit.attach(conn, TxState::InTransaction);
        guard::arm(
            &mut unit,
            Arc::downgrade(&self.unit),
            self.pool.hold_timeout(),
        );
        info!(unit = %self.id, "Transaction started");
        Ok(())
    }

    /// Commit and release. No-op when no connection is held.
    pub async fn commit(&self) -> DbResult<()> {
        let mut unit = self.unit.lock().await;
        unit.close_hold(HoldOutcome::Commit).await
    }

    /// Roll back and release. No-op when no connection is held.
    pub async fn rollback(&self) -> DbResult<()> {
        let mut unit = self.unit.lock().await;
        unit.close_hold(HoldOutcome::Rollback).await
    }

    /// End the unit of work.
    ///
    /// Releases a held connection without issuing COMMIT; a transaction
    /// still open at this point is rolled back best-effort. Never fails.
    pub async fn finish(&self) {
        let mut unit = self.unit.lock().await;
        let _ = unit.close_hold(HoldOutcome::Abandon).await;
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> TxState {
        self.unit.lock().await.state
    }

    /// Whether an explicit transaction is currently open.
    pub async fn in_transaction(&self) -> bool {
        self.state().await == TxState::InTransaction
    }
}

impl fmt::Debug for DbContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbContext").field("id", &self.id).finish()
    }
}
