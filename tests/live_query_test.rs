//! Transactional query retry behavior against a real PostgreSQL instance.
//!
//! These exercise the in-transaction retry loop, which keeps per-attempt
//! state (the already-open connection) and therefore runs its own loop
//! rather than the generic policy combinator. Failures are injected with
//! `RAISE SQLSTATE`, so the connection genuinely goes through
//! rollback-and-retry. Requires `DATABASE_URL` to point at a reachable
//! database; run with `cargo test -- --ignored`.

use sqlmq_transport::agent::Supervisor;
use sqlmq_transport::config::PgHostSettings;
use sqlmq_transport::connection::ConnectionContext;
use sqlmq_transport::error::{is_transient_pg_error, Result, SqlTransportError};
use sqlmq_transport::retry::RetryPolicy;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn live_settings() -> Option<PgHostSettings> {
    init_tracing();
    let url = std::env::var("DATABASE_URL").ok()?;
    let parsed = url::Url::parse(&url).ok()?;
    Some(
        PgHostSettings::new()
            .with_host(parsed.host_str().unwrap_or("localhost"))
            .with_port(parsed.port().unwrap_or(5432))
            .with_database(parsed.path().trim_start_matches('/'))
            .with_credentials(parsed.username(), parsed.password().unwrap_or("")),
    )
}

fn live_context(supervisor: &Supervisor, retry: RetryPolicy) -> Arc<ConnectionContext> {
    let settings = live_settings().expect("DATABASE_URL must be set for this test");
    ConnectionContext::new(Arc::new(settings), retry, supervisor)
        .expect("context should construct")
}

#[tokio::test]
#[ignore = "requires a live PostgreSQL via DATABASE_URL"]
async fn transient_failures_retry_on_the_same_connection() {
    let supervisor = Supervisor::new();
    let context = live_context(&supervisor, RetryPolicy::pg_default());

    // Serialization failures on the first two attempts, then success. The
    // retried attempts re-enter the transaction on the connection opened for
    // this call.
    let attempts = Arc::new(AtomicU32::new(0));
    let observed = context
        .query({
            let attempts = attempts.clone();
            move |conn| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if attempt < 3 {
                        sqlx::query("DO $$ BEGIN RAISE SQLSTATE '40001'; END $$")
                            .execute(&mut *conn)
                            .await?;
                    }
                    sqlx::query("SELECT 1").execute(conn).await?;
                    Ok(attempt)
                })
            }
        })
        .await
        .expect("third attempt should commit");

    assert_eq!(observed, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    supervisor.stop();
}

#[tokio::test]
#[ignore = "requires a live PostgreSQL via DATABASE_URL"]
async fn non_transient_failures_propagate_without_retry() {
    let supervisor = Supervisor::new();
    let context = live_context(&supervisor, RetryPolicy::pg_default());

    let attempts = Arc::new(AtomicU32::new(0));
    let result: Result<()> = context
        .query({
            let attempts = attempts.clone();
            move |conn| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    // unique_violation is not transient; no retry.
                    sqlx::query("DO $$ BEGIN RAISE SQLSTATE '23505'; END $$")
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            }
        })
        .await;

    assert!(matches!(result, Err(SqlTransportError::Database(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    supervisor.stop();
}

#[tokio::test]
#[ignore = "requires a live PostgreSQL via DATABASE_URL"]
async fn exhausted_ceiling_propagates_the_last_error() {
    let supervisor = Supervisor::new();
    let policy = RetryPolicy::new(3, Arc::new(is_transient_pg_error));
    let context = live_context(&supervisor, policy);

    let attempts = Arc::new(AtomicU32::new(0));
    let result: Result<()> = context
        .query({
            let attempts = attempts.clone();
            move |conn| {
                let attempts = attempts.clone();
                Box::pin(async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    sqlx::query("DO $$ BEGIN RAISE SQLSTATE '40001'; END $$")
                        .execute(conn)
                        .await?;
                    Ok(())
                })
            }
        })
        .await;

    assert!(matches!(result, Err(SqlTransportError::Database(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    supervisor.stop();
}
