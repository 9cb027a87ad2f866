//! Integration tests for the hold-timeout guard.
//!
//! These pools are configured with very short hold timeouts so the reaper
//! fires within the test. All run against temporary SQLite databases.

use dbtx::{DbContext, DbError, DbPool, NullSink, PoolSettings, TxState};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn short_hold_pool(hold_ms: u64) -> (NamedTempFile, DbPool) {
    let tmp = NamedTempFile::new().expect("create temp file");
    let db_path = tmp.path().to_str().expect("temp path should be utf8");
    let settings = PoolSettings {
        max_connections: Some(1),
        acquire_timeout_secs: Some(2),
        hold_timeout_ms: Some(hold_ms),
        ..Default::default()
    };
    let pool = DbPool::connect_url(
        &format!("sqlite:{db_path}?mode=rwc"),
        &settings,
        false,
        Arc::new(NullSink),
    )
    .await
    .expect("pool should connect");

    pool.exec("create table events (id integer primary key, note text)")
        .update()
        .await
        .expect("create table should run");
    (tmp, pool)
}

async fn note_of(pool: &DbPool, id: i64) -> Option<String> {
    pool.exec("select note from events where id = ?")
        .bind(id)
        .first()
        .await
        .expect("select should run")
        .and_then(|row| row.get("note").and_then(|v| v.as_str().map(String::from)))
}

#[tokio::test]
async fn test_timed_out_transaction_is_reclaimed() {
    trace_init();
    let (_tmp, pool) = short_hold_pool(150).await;
    let ctx = DbContext::new(&pool);

    ctx.begin().await.expect("begin should succeed");
    ctx.sql("insert into events (id, note) values (?, ?)")
        .bind(1_i64)
        .bind("doomed")
        .update()
        .await
        .expect("insert should run");

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(ctx.state().await, TxState::TimedOut);
    assert_eq!(note_of(&pool, 1).await, None, "transaction rolls back");
    let stats = pool.stats();
    assert_eq!(stats.used, 0);
    assert_eq!(stats.acquired, stats.released);
}

#[tokio::test]
async fn test_waiter_succeeds_after_forced_reclaim() {
    trace_init();
    let (_tmp, pool) = short_hold_pool(150).await;
    let ctx = DbContext::new(&pool);

    // holds the pool's only connection
    ctx.begin().await.expect("begin should succeed");

    let waiter_pool = pool.clone();
    let waiter = tokio::spawn(async move {
        let conn = waiter_pool.acquire().await?;
        conn.release();
        Ok::<_, DbError>(())
    });

    waiter
        .await
        .expect("waiter task should not panic")
        .expect("waiter should get the reclaimed connection");
    assert_eq!(ctx.state().await, TxState::TimedOut);
}

#[tokio::test]
async fn test_stale_unit_fails_fast() {
    trace_init();
    let (_tmp, pool) = short_hold_pool(100).await;
    let ctx = DbContext::new(&pool);

    ctx.begin().await.expect("begin should succeed");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let err = ctx
        .sql("select 1")
        .first()
        .await
        .expect_err("statements on a timed-out unit should fail");
    assert!(matches!(
        err,
        DbError::UnitClosed {
            state: TxState::TimedOut
        }
    ));
}

#[tokio::test]
async fn test_plain_connection_hold_is_reclaimed() {
    trace_init();
    let (_tmp, pool) = short_hold_pool(100).await;
    let ctx = DbContext::new(&pool);

    // no begin: the statement autocommits but the connection stays attached
    ctx.sql("insert into events (id, note) values (?, ?)")
        .bind(2_i64)
        .bind("kept")
        .update()
        .await
        .expect("insert should run");
    assert_eq!(ctx.state().await, TxState::Connected);

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(ctx.state().await, TxState::TimedOut);
    // the write already committed, so reclaiming does not undo it
    assert_eq!(note_of(&pool, 2).await, Some("kept".to_string()));
    assert_eq!(pool.stats().used, 0);
}

#[tokio::test]
async fn test_commit_before_timeout_disarms_guard() {
    trace_init();
    let (_tmp, pool) = short_hold_pool(150).await;
    let ctx = DbContext::new(&pool);

    ctx.begin().await.expect("begin should succeed");
    ctx.sql("insert into events (id, note) values (?, ?)")
        .bind(3_i64)
        .bind("fast")
        .update()
        .await
        .expect("insert should run");
    ctx.commit().await.expect("commit should succeed");

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert_eq!(ctx.state().await, TxState::Committed);
    assert_eq!(note_of(&pool, 3).await, Some("fast".to_string()));
    assert_eq!(pool.stats().used, 0);
}

#[tokio::test]
async fn test_begin_rearms_guard() {
    trace_init();
    let (_tmp, pool) = short_hold_pool(300).await;
    let ctx = DbContext::new(&pool);

    ctx.begin().await.expect("first begin should succeed");
    tokio::time::sleep(Duration::from_millis(180)).await;

    // past half the first deadline; a fresh begin must reset the clock
    ctx.begin().await.expect("second begin should succeed");
    tokio::time::sleep(Duration::from_millis(180)).await;

    assert!(
        ctx.in_transaction().await,
        "the first guard must not fire after re-arming"
    );
    ctx.commit().await.expect("commit should succeed");
    assert_eq!(ctx.state().await, TxState::Committed);
}

#[tokio::test]
async fn test_commit_guard_race_is_settled() {
    trace_init();
    let (_tmp, pool) = short_hold_pool(60).await;

    for i in 0..20_i64 {
        let ctx = DbContext::new(&pool);
        ctx.begin().await.expect("begin should succeed");
        ctx.sql("insert into events (id, note) values (?, ?)")
            .bind(i)
            .bind("raced")
            .update()
            .await
            .expect("insert should run");

        let jitter = {
            let mut rng = rand::thread_rng();
            rng.gen_range(45..=75)
        };
        tokio::time::sleep(Duration::from_millis(jitter)).await;

        // whichever side loses the race finds the unit already closed
        ctx.commit().await.expect("losing the race is not an error");

        let state = ctx.state().await;
        assert!(
            state == TxState::Committed || state == TxState::TimedOut,
            "unexpected state after race: {state}"
        );
        let committed = state == TxState::Committed;
        assert_eq!(
            note_of(&pool, i).await.is_some(),
            committed,
            "row visibility must match the race outcome"
        );
        assert_eq!(pool.stats().used, 0);
    }

    let stats = pool.stats();
    assert_eq!(stats.acquired, stats.released);
}
