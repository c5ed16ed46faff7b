//! Wake-multiplexing behavior through the public API, no database required.
//!
//! The notification agent runs against an unreachable endpoint in these
//! tests; it stays in its reconnect loop in the background, which is exactly
//! the resilient behavior the transport promises. All waking here goes
//! through the signal table, the same path a real notification uses.

use sqlmq_transport::agent::Supervisor;
use sqlmq_transport::config::PgHostSettings;
use sqlmq_transport::connection::ConnectionContext;
use sqlmq_transport::retry::RetryPolicy;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn unreachable_settings() -> PgHostSettings {
    PgHostSettings::new().with_host("127.0.0.1").with_port(1)
}

fn context(supervisor: &Supervisor) -> Arc<ConnectionContext> {
    init_tracing();
    ConnectionContext::new(
        Arc::new(unreachable_settings()),
        RetryPolicy::pg_default(),
        supervisor,
    )
    .expect("context should construct without touching the database")
}

#[tokio::test]
async fn delay_returns_within_timeout_without_notification() {
    let supervisor = Supervisor::new();
    let context = context(&supervisor);

    for queue_id in [1i64, 2, 3] {
        let started = Instant::now();
        context
            .delay_until_message_ready(queue_id, Duration::from_millis(40))
            .await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(
            elapsed < Duration::from_secs(2),
            "queue {queue_id} overshot: {elapsed:?}"
        );
    }
    supervisor.stop();
}

#[tokio::test]
async fn wake_before_timeout_returns_early() {
    let supervisor = Supervisor::new();
    let context = context(&supervisor);

    let firer = tokio::spawn({
        let registry = context.registry();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            registry.fire(42);
        }
    });

    let started = Instant::now();
    context
        .delay_until_message_ready(42, Duration::from_secs(30))
        .await;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "wake should beat the 30s timeout"
    );
    firer.await.expect("firer should not panic");
    supervisor.stop();
}

#[tokio::test]
async fn concurrent_waiters_on_one_queue_all_wake() {
    let supervisor = Supervisor::new();
    let context = context(&supervisor);

    let mut waiters = Vec::new();
    for _ in 0..4 {
        let context = context.clone();
        waiters.push(tokio::spawn(async move {
            let started = Instant::now();
            context
                .delay_until_message_ready(7, Duration::from_secs(30))
                .await;
            started.elapsed()
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    context.registry().fire(7);

    for waiter in waiters {
        let elapsed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
        assert!(elapsed < Duration::from_secs(10));
    }
    supervisor.stop();
}

#[tokio::test]
async fn stale_fire_does_not_wake_the_next_waiter() {
    let supervisor = Supervisor::new();
    let context = context(&supervisor);

    // First waiter woken by a fire; its entry must be rotated on the way out.
    let woken = tokio::spawn({
        let context = context.clone();
        async move {
            context
                .delay_until_message_ready(5, Duration::from_secs(30))
                .await;
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    context.registry().fire(5);
    tokio::time::timeout(Duration::from_secs(5), woken)
        .await
        .expect("first waiter should wake")
        .expect("first waiter should not panic");

    // Second waiter must see a fresh signal and time out normally.
    let started = Instant::now();
    context
        .delay_until_message_ready(5, Duration::from_millis(60))
        .await;
    assert!(started.elapsed() >= Duration::from_millis(60));
    supervisor.stop();
}

#[tokio::test]
async fn stop_unblocks_waiters_and_terminates_agents() {
    let supervisor = Supervisor::new();
    let context = context(&supervisor);

    let waiter = tokio::spawn({
        let context = context.clone();
        async move {
            context
                .delay_until_message_ready(11, Duration::from_secs(60))
                .await;
        }
    });
    tokio::time::sleep(Duration::from_millis(30)).await;

    supervisor.stop();
    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("stop should unblock the waiter")
        .expect("waiter should not panic");
}
