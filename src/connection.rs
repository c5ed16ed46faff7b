//! # Connection context
//!
//! One [`ConnectionContext`] exists per transport host. It owns the host
//! settings and retry policy, opens a private physical connection per
//! [`query`](ConnectionContext::query) call, and registers the two background
//! agents (notification, maintenance) with the supervisor for its lifetime.
//!
//! The retry asymmetry is deliberate: connection acquisition failures are not
//! retried here, only in-transaction transient failures are. A retried
//! attempt re-enters the transaction on the same already-open connection.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::{Connection, PgConnection, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentHandle, Supervisor};
use crate::config::{HostSettings, IsolationLevel, PgHostSettings};
use crate::error::{Result, SqlTransportError};
use crate::maintenance::MaintenanceAgent;
use crate::notification::{NotificationAgent, NotificationStats};
use crate::retry::RetryPolicy;
use crate::signals::WakeSignal;

/// A single opened physical connection
pub struct TransportConnection {
    inner: PgConnection,
    endpoint: String,
}

impl TransportConnection {
    /// Open a new physical connection using the host settings.
    ///
    /// Open failures surface as endpoint errors carrying the host URI and are
    /// not retried at this layer.
    pub(crate) async fn open(settings: &PgHostSettings) -> Result<Self> {
        let inner = PgConnection::connect(&settings.connection_url())
            .await
            .map_err(|error| {
                SqlTransportError::endpoint_with_source(
                    settings.endpoint_uri(),
                    "failed to open connection",
                    error.into(),
                )
            })?;
        debug!(endpoint = %settings.endpoint_uri(), "opened transport connection");
        Ok(Self {
            inner,
            endpoint: settings.endpoint_uri(),
        })
    }

    /// Begin a transaction at the given isolation level
    pub async fn begin(&mut self, isolation: IsolationLevel) -> Result<Transaction<'_, Postgres>> {
        let mut tx = Connection::begin(&mut self.inner).await?;
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    /// The endpoint this connection belongs to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Raw driver connection, for parameterized statements outside [`Self::begin`]
    pub fn as_inner(&mut self) -> &mut PgConnection {
        &mut self.inner
    }

    /// Close the connection cleanly
    pub async fn close(self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Per-host transport context owning the two background agents
pub struct ConnectionContext {
    settings: Arc<PgHostSettings>,
    retry: RetryPolicy,
    notification: Arc<NotificationAgent>,
    stop: Arc<WakeSignal>,
    agents: Mutex<Vec<AgentHandle>>,
}

impl ConnectionContext {
    /// Create the context and hand its agents to the supervisor.
    ///
    /// `settings` must be PostgreSQL host settings; any other concrete type is
    /// a fatal configuration error raised here, before any connection is
    /// attempted. Must be called within a Tokio runtime: the agents are
    /// spawned immediately.
    pub fn new(
        settings: Arc<dyn HostSettings>,
        retry: RetryPolicy,
        supervisor: &Supervisor,
    ) -> Result<Arc<Self>> {
        let pg_settings = settings
            .as_any()
            .downcast_ref::<PgHostSettings>()
            .cloned()
            .ok_or_else(|| {
                SqlTransportError::config(format!(
                    "expected PostgreSQL host settings, got {settings:?}"
                ))
            })?;
        pg_settings.validate()?;

        let settings = Arc::new(pg_settings);
        let notification = Arc::new(NotificationAgent::new(settings.clone(), retry.clone()));
        let context = Arc::new(Self {
            settings: settings.clone(),
            retry,
            notification: notification.clone(),
            stop: supervisor.stop_signal(),
            agents: Mutex::new(Vec::new()),
        });

        let maintenance = Arc::new(MaintenanceAgent::new(context.clone()));
        {
            let mut agents = context.agents.lock();
            agents.push(supervisor.supervise(notification));
            agents.push(supervisor.supervise(maintenance));
        }

        info!(endpoint = %settings.endpoint_uri(), "connection context created");
        Ok(context)
    }

    /// Host settings for this context
    pub fn settings(&self) -> &PgHostSettings {
        &self.settings
    }

    /// Retry policy shared by queries and the agents
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Notification agent statistics snapshot
    pub fn notification_stats(&self) -> NotificationStats {
        self.notification.stats()
    }

    /// The per-queue signal table shared with the notification agent.
    ///
    /// Firing a queue's signal here is equivalent to that queue's
    /// notification arriving; integration tests use it to exercise the wake
    /// path without a database.
    pub fn registry(&self) -> Arc<crate::signals::SignalRegistry> {
        self.notification.registry()
    }

    /// Open a new physical connection. Not retried at this layer.
    pub async fn create_connection(&self) -> Result<TransportConnection> {
        TransportConnection::open(&self.settings).await
    }

    /// Run `work` inside a transaction at the configured isolation level.
    ///
    /// Opens a private connection for this call, then retries the
    /// transaction/work/commit sequence on that same connection for transient
    /// failures, up to the policy ceiling. `work` must therefore be safe to
    /// re-execute; it receives the in-transaction connection handle.
    #[instrument(skip(self, work), fields(endpoint = %self.settings.endpoint_uri()))]
    pub async fn query<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
    {
        let mut conn = self.create_connection().await?;
        let mut attempt = 1u32;
        loop {
            match self.run_in_transaction(&mut conn, &work).await {
                Ok(value) => return Ok(value),
                Err(error)
                    if attempt < self.retry.max_attempts() && self.retry.is_transient(&error) =>
                {
                    warn!(
                        attempt,
                        max_attempts = self.retry.max_attempts(),
                        error = %error,
                        "transient failure inside transaction, retrying on same connection"
                    );
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn run_in_transaction<T, F>(
        &self,
        conn: &mut TransportConnection,
        work: &F,
    ) -> Result<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send + Sync,
    {
        let mut tx = conn.begin(self.settings.isolation_level).await?;
        match work(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    debug!(error = %rollback_error, "rollback after failed work also failed");
                }
                Err(error)
            }
        }
    }

    /// Wait until queue `queue_id` may have new work, the timeout elapses or
    /// shutdown begins, whichever is first.
    ///
    /// The wake is advisory: a timeout is the normal "poll again" outcome and
    /// is indistinguishable from a wake, so callers always re-check queue
    /// state after return. Dropping the returned future is the caller-side
    /// cancellation path. If the signal fired, its entry is rotated so a
    /// subsequent waiter never observes the stale fire.
    pub async fn delay_until_message_ready(&self, queue_id: i64, timeout: Duration) {
        let signal = self.notification.signal_for_queue(queue_id);
        tokio::select! {
            _ = signal.wait() => {}
            _ = tokio::time::sleep(timeout) => {}
            _ = self.stop.wait() => {}
        }
        if signal.is_fired() {
            self.notification.rotate_signal(queue_id, &signal);
        }
    }

    /// Release the context. Log-only: no connection is held at this layer and
    /// agent shutdown is driven by the supervisor's stop signal.
    pub fn close(&self) {
        let agents = self.agents.lock();
        info!(
            endpoint = %self.settings.endpoint_uri(),
            agents = agents.len(),
            "connection context released"
        );
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("endpoint", &self.settings.endpoint_uri())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
