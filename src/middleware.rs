//! Transactional middleware.

use crate::context::DbContext;
use crate::error::DbError;
use crate::pool::DbPool;
use std::future::Future;
use tracing::{debug, warn};

/// Run a handler inside a unit of work.
///
/// The handler gets a [`DbContext`]; connections are only acquired if it
/// actually issues statements. When the handler returns `Ok` and opened a
/// transaction, the transaction is committed; a commit failure becomes the
/// unit's error. When the handler returns `Err`, any open transaction is
/// rolled back and the handler's own error is preserved. The unit is always
/// finished, so the connection goes back to the pool on every path.
///
/// ```ignore
/// let moved = transactional(&pool, |ctx| async move {
///     ctx.begin().await?;
///     ctx.sql("update accounts set balance = balance - ? where id = ?")
///         .bind(100_i64)
///         .bind(1_i64)
///         .update()
///         .await?;
///     ctx.sql("update accounts set balance = balance + ? where id = ?")
///         .bind(100_i64)
///         .bind(2_i64)
///         .update()
///         .await
/// })
/// .await?;
/// ```
pub async fn transactional<T, E, F, Fut>(pool: &DbPool, handler: F) -> Result<T, E>
where
    F: FnOnce(DbContext) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<DbError>,
{
    let ctx = DbContext::new(pool);
    debug!(unit = %ctx.id(), "Unit of work started");

    match handler(ctx.clone()).await {
        Ok(value) => {
            if ctx.in_transaction().await {
                if let Err(e) = ctx.commit().await {
                    ctx.finish().await;
                    return Err(E::from(e));
                }
            }
            ctx.finish().await;
            Ok(value)
        }
        Err(err) => {
            if ctx.in_transaction().await {
                if let Err(rollback_err) = ctx.rollback().await {
                    warn!(
                        unit = %ctx.id(),
                        error = %rollback_err,
                        "Rollback after handler failure also failed"
                    );
                }
            }
            ctx.finish().await;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::metrics::NullSink;
    use std::sync::Arc;

    async fn memory_pool() -> DbPool {
        let settings = PoolSettings {
            max_connections: Some(1),
            ..Default::default()
        };
        DbPool::connect_url("sqlite::memory:", &settings, false, Arc::new(NullSink))
            .await
            .expect("in-memory pool should connect")
    }

    #[tokio::test]
    async fn test_handler_without_statements_acquires_nothing() {
        let pool = memory_pool().await;
        let before = pool.stats().acquired;

        let out: Result<i64, DbError> = transactional(&pool, |_ctx| async move { Ok(5) }).await;
        assert_eq!(out.unwrap(), 5);

        let stats = pool.stats();
        assert_eq!(stats.acquired, before);
        assert_eq!(stats.used, 0);
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let pool = memory_pool().await;
        let out: Result<(), DbError> = transactional(&pool, |_ctx| async move {
            Err(DbError::internal("boom"))
        })
        .await;
        let err = out.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(pool.stats().used, 0);
    }
}
