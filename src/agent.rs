//! # Background agent lifecycle
//!
//! The transport runs two perpetual background agents (notification and
//! maintenance). Each implements [`TransportAgent`]: an independent task that
//! receives a shared stop signal at start and runs until that signal fires.
//! The [`Supervisor`] owns the stop signal, spawns agents onto the runtime and
//! hands back an [`AgentHandle`] exposing the ready/completed lifecycle.
//!
//! Agents never propagate errors outward; a failed iteration is logged inside
//! the agent and the loop continues. Only the stop signal terminates a run.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::signals::WakeSignal;

/// A background agent with a stop signal and a ready/completed lifecycle
#[async_trait]
pub trait TransportAgent: Send + Sync + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Run the agent until `stop` fires. Must not panic on iteration failures.
    async fn run(self: Arc<Self>, stop: Arc<WakeSignal>);
}

/// Handle to a supervised agent task
#[derive(Debug)]
pub struct AgentHandle {
    name: &'static str,
    ready: Arc<WakeSignal>,
    completed: Arc<WakeSignal>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    /// Agent name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal fired once the agent's run loop has been entered
    pub fn ready(&self) -> Arc<WakeSignal> {
        self.ready.clone()
    }

    /// Signal fired once the agent's run loop has returned
    pub fn completed(&self) -> Arc<WakeSignal> {
        self.completed.clone()
    }

    /// Wait until the agent has started running
    pub async fn await_ready(&self) {
        self.ready.wait().await;
    }

    /// Wait until the agent has terminated
    pub async fn await_completed(&self) {
        self.completed.wait().await;
    }

    /// Whether the agent has terminated
    pub fn is_completed(&self) -> bool {
        self.completed.is_fired()
    }

    /// Abort the underlying task. Normal shutdown goes through the
    /// supervisor's stop signal; this is the hard fallback.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Owns the shared stop signal and spawns agents onto the runtime
#[derive(Debug, Default)]
pub struct Supervisor {
    stop: Arc<WakeSignal>,
}

impl Supervisor {
    /// Create a supervisor with a fresh stop signal
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared stop signal handed to every supervised agent
    pub fn stop_signal(&self) -> Arc<WakeSignal> {
        self.stop.clone()
    }

    /// Whether shutdown has been requested
    pub fn is_stopping(&self) -> bool {
        self.stop.is_fired()
    }

    /// Spawn an agent, wiring up its lifecycle signals
    pub fn supervise<A: TransportAgent>(&self, agent: Arc<A>) -> AgentHandle {
        let name = agent.name();
        let stop = self.stop.clone();
        let ready = Arc::new(WakeSignal::new());
        let completed = Arc::new(WakeSignal::new());

        let task_ready = ready.clone();
        let task_completed = completed.clone();
        let task = tokio::spawn(async move {
            debug!(agent = name, "agent task starting");
            task_ready.fire();
            agent.run(stop).await;
            task_completed.fire();
            debug!(agent = name, "agent task completed");
        });

        info!(agent = name, "agent supervised");
        AgentHandle {
            name,
            ready,
            completed,
            task,
        }
    }

    /// Request shutdown of every supervised agent
    pub fn stop(&self) {
        info!("supervisor stop requested");
        self.stop.fire();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct SleepUntilStopped {
        observed_stop: AtomicBool,
    }

    #[async_trait]
    impl TransportAgent for SleepUntilStopped {
        fn name(&self) -> &'static str {
            "sleep-until-stopped"
        }

        async fn run(self: Arc<Self>, stop: Arc<WakeSignal>) {
            stop.wait().await;
            self.observed_stop.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn agent_runs_until_stop_fires() {
        let supervisor = Supervisor::new();
        let agent = Arc::new(SleepUntilStopped {
            observed_stop: AtomicBool::new(false),
        });
        let handle = supervisor.supervise(agent.clone());

        tokio::time::timeout(Duration::from_secs(1), handle.await_ready())
            .await
            .expect("agent should become ready");
        assert!(!handle.is_completed());

        supervisor.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.await_completed())
            .await
            .expect("agent should complete after stop");
        assert!(agent.observed_stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_terminates_multiple_agents() {
        let supervisor = Supervisor::new();
        let first = supervisor.supervise(Arc::new(SleepUntilStopped {
            observed_stop: AtomicBool::new(false),
        }));
        let second = supervisor.supervise(Arc::new(SleepUntilStopped {
            observed_stop: AtomicBool::new(false),
        }));

        supervisor.stop();
        tokio::time::timeout(Duration::from_secs(1), async {
            first.await_completed().await;
            second.await_completed().await;
        })
        .await
        .expect("both agents should stop");
    }
}
