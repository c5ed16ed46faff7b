//! # Notification agent
//!
//! Maintains exactly one long-lived LISTEN/NOTIFY subscription connection and
//! multiplexes per-queue wake requests from arbitrary numbers of consumers
//! onto it. Consumers obtain a [`WakeSignal`] via [`NotificationAgent::signal_for_queue`];
//! the agent fires that signal when a `transport_msg_<queue_id>` notification
//! arrives on the shared connection.
//!
//! Registering a previously-unknown queue does not tear the connection down:
//! it fires the restart signal, which interrupts the loop's idle wait so the
//! new channel can be subscribed on the existing connection. The subscription
//! set is scoped to one connection and reset on every reconnect.
//!
//! Wakes are advisory. There is a window between registering interest and the
//! subscription being added during which a notification can be missed, so
//! callers always re-check queue state after waking and re-arm after a
//! timeout; notifications buy latency, not correctness.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::postgres::PgListener;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::agent::TransportAgent;
use crate::config::{message_ready_channel, require_queue_id, PgHostSettings};
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::signals::{SignalRegistry, WakeSignal};

/// Pause before a reconnect attempt after the retry ceiling is exhausted
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// Statistics about the notification agent
#[derive(Debug, Clone, Default)]
pub struct NotificationStats {
    pub connected: bool,
    pub connects: u64,
    pub channels_subscribed: usize,
    pub notifications_received: u64,
    pub unroutable_notifications: u64,
    pub parse_errors: u64,
    pub connection_errors: u64,
    pub last_notification_at: Option<SystemTime>,
    pub last_error_at: Option<SystemTime>,
}

/// Background agent owning the shared subscription connection
pub struct NotificationAgent {
    settings: Arc<PgHostSettings>,
    retry: RetryPolicy,
    registry: Arc<SignalRegistry>,
    /// Current restart signal; replaced with a fresh instance each time it
    /// fires so a burst of registrations coalesces into one extra pass.
    restart: Mutex<Arc<WakeSignal>>,
    stats: Arc<RwLock<NotificationStats>>,
    instance_id: Uuid,
}

impl NotificationAgent {
    /// Create an agent for the given host. No connection is opened until the
    /// agent is supervised and its run loop starts.
    pub fn new(settings: Arc<PgHostSettings>, retry: RetryPolicy) -> Self {
        Self {
            settings,
            retry,
            registry: Arc::new(SignalRegistry::new()),
            restart: Mutex::new(Arc::new(WakeSignal::new())),
            stats: Arc::new(RwLock::new(NotificationStats::default())),
            instance_id: Uuid::new_v4(),
        }
    }

    /// The per-queue signal table shared with the connection context
    pub fn registry(&self) -> Arc<SignalRegistry> {
        self.registry.clone()
    }

    /// Snapshot of agent statistics
    pub fn stats(&self) -> NotificationStats {
        self.stats.read().unwrap().clone()
    }

    /// Idempotent get-or-create of the wake signal for `queue_id`.
    ///
    /// A first-ever registration fires the restart signal so the subscription
    /// loop adds the channel without waiting for the next notification or
    /// reconnect. A signal that has already fired is rotated before being
    /// handed back; callers never receive a spent signal.
    pub fn signal_for_queue(&self, queue_id: i64) -> Arc<WakeSignal> {
        let (signal, inserted) = self.registry.get_or_create(queue_id);
        if inserted {
            debug!(queue_id, "new queue registered, interrupting subscription wait");
            self.restart.lock().fire();
            return signal;
        }
        if signal.is_fired() {
            return self.registry.rotate(queue_id, &signal);
        }
        signal
    }

    /// Compare-and-swap rotation of a queue's signal, delegated to the registry
    pub fn rotate_signal(&self, queue_id: i64, current: &Arc<WakeSignal>) -> Arc<WakeSignal> {
        self.registry.rotate(queue_id, current)
    }

    fn restart_signal(&self) -> Arc<WakeSignal> {
        self.restart.lock().clone()
    }

    /// Swap in a fresh restart signal. Called before diffing subscriptions so
    /// a registration racing with the swap lands either in the diff or on the
    /// fresh signal, never in between.
    fn replace_restart_signal(&self) {
        *self.restart.lock() = Arc::new(WakeSignal::new());
    }

    /// Open the subscription connection and LISTEN on every channel for the
    /// queues known at connect time. The whole sequence runs inside the retry
    /// policy; a transient failure restarts it from scratch.
    async fn open_subscription(&self) -> Result<(PgListener, HashSet<i64>)> {
        let mut listener = PgListener::connect(&self.settings.connection_url()).await?;
        let mut subscribed = HashSet::new();
        for queue_id in self.registry.known_queues() {
            listener.listen(&message_ready_channel(queue_id)).await?;
            subscribed.insert(queue_id);
        }
        Ok((listener, subscribed))
    }

    /// LISTEN on any known queues not yet in this connection's subscription
    /// set, without dropping the connection or duplicating subscriptions.
    async fn subscribe_missing(
        &self,
        listener: &mut PgListener,
        subscribed: &mut HashSet<i64>,
    ) -> Result<()> {
        for queue_id in self.registry.known_queues() {
            if subscribed.contains(&queue_id) {
                continue;
            }
            listener.listen(&message_ready_channel(queue_id)).await?;
            subscribed.insert(queue_id);
            debug!(queue_id, "subscribed to queue channel");
        }
        {
            let mut stats = self.stats.write().unwrap();
            stats.channels_subscribed = subscribed.len();
        }
        Ok(())
    }

    /// Route one inbound notification to its queue's wake signal.
    ///
    /// This is the sole wakeup path for `delay_until_message_ready`.
    fn dispatch(&self, channel: &str) {
        match require_queue_id(channel) {
            Ok(queue_id) => {
                let routed = self.registry.fire(queue_id);
                let mut stats = self.stats.write().unwrap();
                stats.notifications_received += 1;
                stats.last_notification_at = Some(SystemTime::now());
                if !routed {
                    stats.unroutable_notifications += 1;
                    debug!(queue_id, "notification for unregistered queue dropped");
                }
            }
            Err(error) => {
                let mut stats = self.stats.write().unwrap();
                stats.parse_errors += 1;
                stats.last_error_at = Some(SystemTime::now());
                debug!(error = %error, "unrecognized notification channel");
            }
        }
    }

    /// One connection's lifetime: connect, subscribe, then wait on
    /// notification/restart/stop until the connection fails or stop fires.
    async fn serve_connection(&self, stop: &WakeSignal) -> Result<()> {
        let (mut listener, mut subscribed) =
            self.retry.retry(|| self.open_subscription()).await?;

        {
            let mut stats = self.stats.write().unwrap();
            stats.connected = true;
            stats.connects += 1;
            stats.channels_subscribed = subscribed.len();
        }
        info!(
            instance_id = %self.instance_id,
            channels = subscribed.len(),
            "subscription connection established"
        );

        loop {
            let restart = self.restart_signal();
            tokio::select! {
                _ = stop.wait() => {
                    info!(instance_id = %self.instance_id, "stop requested, closing subscription connection");
                    return Ok(());
                }
                _ = restart.wait() => {
                    self.replace_restart_signal();
                    self.subscribe_missing(&mut listener, &mut subscribed).await?;
                }
                notification = listener.recv() => {
                    let notification = notification?;
                    self.dispatch(notification.channel());
                }
            }
        }
    }

    async fn run_loop(&self, stop: &WakeSignal) {
        while !stop.is_fired() {
            match self.serve_connection(stop).await {
                Ok(()) => return, // clean exit on stop
                Err(error) => {
                    {
                        let mut stats = self.stats.write().unwrap();
                        stats.connected = false;
                        stats.channels_subscribed = 0;
                        stats.connection_errors += 1;
                        stats.last_error_at = Some(SystemTime::now());
                    }
                    warn!(
                        instance_id = %self.instance_id,
                        error = %error,
                        "subscription connection lost, reconnecting"
                    );
                    // Subscription set died with the connection; the next
                    // serve_connection re-snapshots the registry.
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
                        _ = stop.wait() => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl TransportAgent for NotificationAgent {
    fn name(&self) -> &'static str {
        "notification"
    }

    #[instrument(skip(self, stop), fields(instance_id = %self.instance_id))]
    async fn run(self: Arc<Self>, stop: Arc<WakeSignal>) {
        info!("notification agent starting");
        self.run_loop(&stop).await;
        {
            let mut stats = self.stats.write().unwrap();
            stats.connected = false;
            stats.channels_subscribed = 0;
        }
        info!("notification agent stopped");
    }
}

impl std::fmt::Debug for NotificationAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationAgent")
            .field("instance_id", &self.instance_id)
            .field("known_queues", &self.registry.len())
            .finish_non_exhaustive()
    }
}
