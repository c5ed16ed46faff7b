//! # sqlmq-transport
//!
//! PostgreSQL-backed message queue transport core. Queues are rows in tables;
//! message arrival is signaled out-of-band via LISTEN/NOTIFY instead of
//! polling. This crate implements the connection, notification and
//! maintenance plumbing that makes that signal reliable across many
//! independently-registered queues sharing one subscription connection.
//!
//! ## Architecture
//!
//! - [`connection::ConnectionContext`] - one per transport host: opens
//!   private connections, runs retry-wrapped transactional queries and exposes
//!   `delay_until_message_ready` for consumers.
//! - [`notification::NotificationAgent`] - background task owning the single
//!   long-lived subscription connection, multiplexing per-queue wake signals
//!   onto it and re-subscribing on reconnect.
//! - [`maintenance::MaintenanceAgent`] - background task running the jittered
//!   metrics-aggregation and stale-topology-purge loop.
//! - [`signals`] - one-shot wake signals and the concurrent per-queue table.
//! - [`agent::Supervisor`] - owns the shared stop signal and the agents'
//!   ready/completed lifecycle.
//!
//! Wakes are advisory: `delay_until_message_ready` returning tells the caller
//! to re-check queue state, whether the return was caused by a notification
//! or by the timeout. Notifications improve latency, never correctness.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlmq_transport::agent::Supervisor;
//! use sqlmq_transport::config::PgHostSettings;
//! use sqlmq_transport::connection::ConnectionContext;
//! use sqlmq_transport::retry::RetryPolicy;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let supervisor = Supervisor::new();
//! let settings = PgHostSettings::new()
//!     .with_host("db-1")
//!     .with_database("bus")
//!     .with_schema("transport");
//!
//! let context =
//!     ConnectionContext::new(Arc::new(settings), RetryPolicy::pg_default(), &supervisor)?;
//!
//! // Consumer loop: wait for work on queue 42, then poll it.
//! context
//!     .delay_until_message_ready(42, Duration::from_secs(5))
//!     .await;
//! // ... read from the queue here, then re-arm ...
//!
//! supervisor.stop();
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod connection;
pub mod error;
pub mod maintenance;
pub mod notification;
pub mod retry;
pub mod signals;
pub mod sql;

pub use agent::{AgentHandle, Supervisor, TransportAgent};
pub use config::{HostSettings, IsolationLevel, PgHostSettings};
pub use connection::{ConnectionContext, TransportConnection};
pub use error::{Result, SqlTransportError};
pub use maintenance::{MaintenanceAgent, MaintenanceStats};
pub use notification::{NotificationAgent, NotificationStats};
pub use retry::RetryPolicy;
pub use signals::{SignalRegistry, WakeSignal};
