//! # Maintenance agent
//!
//! Periodic housekeeping for the transport: aggregate pending queue metrics
//! every cycle and purge stale topology rows once per cleanup interval. Both
//! intervals carry fresh random jitter each cycle so multiple transport
//! instances sharing one database drift apart instead of thundering together.
//!
//! All database work goes through [`ConnectionContext::query`], so it gets the
//! same transient-retry treatment as any other caller. A failed cycle is
//! logged and the loop moves on; only the stop signal ends the agent, at which
//! point it performs one best-effort metrics flush (and one purge, if none has
//! ever run) before exiting.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, instrument, warn};

use crate::agent::TransportAgent;
use crate::connection::ConnectionContext;
use crate::error::Result;
use crate::signals::WakeSignal;
use crate::sql;

/// Add jitter in `[0, base/10)` to a base interval
fn jittered(base: Duration) -> Duration {
    base + base.mul_f64(fastrand::f64() / 10.0)
}

/// Maintenance schedule state. Owned exclusively by the agent's loop; pure
/// enough to drive with a simulated clock in tests.
#[derive(Debug)]
pub struct MaintenanceSchedule {
    maintenance_base: Duration,
    cleanup_base: Duration,
    /// Current jittered purge interval; recomputed after every purge
    cleanup_interval: Duration,
    last_purge: Option<Instant>,
}

impl MaintenanceSchedule {
    /// Create a schedule from the base intervals
    pub fn new(maintenance_base: Duration, cleanup_base: Duration) -> Self {
        Self {
            maintenance_base,
            cleanup_base,
            cleanup_interval: jittered(cleanup_base),
            last_purge: None,
        }
    }

    /// Duration to sleep before the next cycle; fresh jitter every call
    pub fn next_wait(&self) -> Duration {
        jittered(self.maintenance_base)
    }

    /// Whether a purge is due: never purged, or the jittered cleanup interval
    /// has elapsed since the last one
    pub fn purge_due(&self, now: Instant) -> bool {
        match self.last_purge {
            None => true,
            Some(last) => now.duration_since(last) >= self.cleanup_interval,
        }
    }

    /// Whether no purge has run during this agent's lifetime
    pub fn never_purged(&self) -> bool {
        self.last_purge.is_none()
    }

    /// Record a completed purge and re-jitter the cleanup interval
    pub fn record_purge(&mut self, now: Instant) {
        self.last_purge = Some(now);
        self.cleanup_interval = jittered(self.cleanup_base);
    }

    /// Time of the most recent purge
    pub fn last_purge(&self) -> Option<Instant> {
        self.last_purge
    }
}

/// Statistics about the maintenance agent
#[derive(Debug, Clone, Default)]
pub struct MaintenanceStats {
    pub cycles: u64,
    pub metrics_batches: u64,
    pub metrics_rows: u64,
    pub purges: u64,
    pub failures: u64,
    pub last_purge_at: Option<SystemTime>,
}

/// Background agent running the jittered maintenance loop
pub struct MaintenanceAgent {
    context: Arc<ConnectionContext>,
    schedule: Mutex<MaintenanceSchedule>,
    stats: Arc<RwLock<MaintenanceStats>>,
}

impl MaintenanceAgent {
    /// Create an agent bound to one connection context
    pub fn new(context: Arc<ConnectionContext>) -> Self {
        let settings = context.settings();
        let schedule = MaintenanceSchedule::new(
            settings.maintenance_interval(),
            settings.cleanup_interval(),
        );
        Self {
            context,
            schedule: Mutex::new(schedule),
            stats: Arc::new(RwLock::new(MaintenanceStats::default())),
        }
    }

    /// Snapshot of agent statistics
    pub fn stats(&self) -> MaintenanceStats {
        self.stats.read().unwrap().clone()
    }

    /// Process one bounded batch of pending queue metrics
    async fn process_metrics(&self) -> Result<u64> {
        let statement = sql::process_metrics_sql(&self.context.settings().schema);
        let row_limit = self.context.settings().metrics_row_limit;

        let rows = self
            .context
            .query(move |conn| {
                let statement = statement.clone();
                Box::pin(async move {
                    let done = sqlx::query(&statement).bind(row_limit).execute(conn).await?;
                    Ok(done.rows_affected())
                })
            })
            .await?;

        {
            let mut stats = self.stats.write().unwrap();
            stats.metrics_batches += 1;
            stats.metrics_rows += rows;
        }
        debug!(rows, "processed metrics batch");
        Ok(rows)
    }

    /// Purge stale topology rows
    async fn purge_topology(&self) -> Result<u64> {
        let statement = sql::purge_topology_sql(&self.context.settings().schema);

        let rows = self
            .context
            .query(move |conn| {
                let statement = statement.clone();
                Box::pin(async move {
                    let done = sqlx::query(&statement).execute(conn).await?;
                    Ok(done.rows_affected())
                })
            })
            .await?;

        {
            let mut stats = self.stats.write().unwrap();
            stats.purges += 1;
            stats.last_purge_at = Some(SystemTime::now());
        }
        info!(rows, "purged stale topology");
        Ok(rows)
    }

    /// One normal cycle: metrics batch, then purge if due
    async fn run_cycle(&self) -> Result<()> {
        self.process_metrics().await?;

        let now = Instant::now();
        if self.schedule.lock().purge_due(now) {
            self.purge_topology().await?;
            self.schedule.lock().record_purge(now);
        }

        self.stats.write().unwrap().cycles += 1;
        Ok(())
    }

    /// Best-effort final pass on shutdown: one metrics flush, plus one purge
    /// only if no purge ever ran. Failures are logged, never propagated.
    async fn drain(&self) {
        info!("stop requested, flushing maintenance work");
        if let Err(error) = self.process_metrics().await {
            debug!(error = %error, "final metrics flush failed");
        }
        if self.schedule.lock().never_purged() {
            match self.purge_topology().await {
                Ok(_) => self.schedule.lock().record_purge(Instant::now()),
                Err(error) => debug!(error = %error, "final topology purge failed"),
            }
        }
    }

    async fn run_loop(&self, stop: &WakeSignal) {
        loop {
            let wait = self.schedule.lock().next_wait();
            debug!(wait_ms = wait.as_millis() as u64, "maintenance sleeping");

            let stopped = tokio::select! {
                _ = tokio::time::sleep(wait) => false,
                _ = stop.wait() => true,
            };
            if stopped {
                self.drain().await;
                return;
            }

            if let Err(error) = self.run_cycle().await {
                self.stats.write().unwrap().failures += 1;
                warn!(error = %error, "maintenance cycle failed, continuing");
            }
        }
    }
}

#[async_trait]
impl TransportAgent for MaintenanceAgent {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    #[instrument(skip(self, stop))]
    async fn run(self: Arc<Self>, stop: Arc<WakeSignal>) {
        info!(
            maintenance_interval_secs = self.context.settings().maintenance_interval_secs,
            cleanup_interval_secs = self.context.settings().cleanup_interval_secs,
            "maintenance agent starting"
        );
        self.run_loop(&stop).await;
        info!("maintenance agent stopped");
    }
}

impl std::fmt::Debug for MaintenanceAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceAgent")
            .field("schedule", &*self.schedule.lock())
            .finish_non_exhaustive()
    }
}
