use chrono::{DateTime, Utc};
use maestro_coordinator::Coordinator;
use maestro_core::{Event, Frame, FrameSink, MaestroConfig, Task, TaskStatus};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often connected agents are checked against the inactive threshold.
const CONNECTION_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// How often all agents are checked against the dead threshold.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(60);

struct ConnectionHandle {
    inbox_tx: mpsc::Sender<Task>,
    in_flight: Arc<AtomicUsize>,
    last_seen: DateTime<Utc>,
}

/// Per-connection view reported on the metrics surface.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub agent_id: String,
    pub inbox_depth: usize,
    pub in_flight: usize,
    pub last_seen: DateTime<Utc>,
}

/// Tracks the "active" subset of agents — those with a live gateway
/// connection — and runs one dispatch loop per agent.
pub struct AgentManager {
    coordinator: Arc<Coordinator>,
    frames: Arc<dyn FrameSink>,
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    config: MaestroConfig,
}

impl AgentManager {
    pub fn new(
        coordinator: Arc<Coordinator>,
        frames: Arc<dyn FrameSink>,
        config: MaestroConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            frames,
            connections: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Spawn the event observer and the two health loops.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Starting agent manager");
        vec![
            tokio::spawn(Arc::clone(self).run_events(shutdown.clone())),
            tokio::spawn(Arc::clone(self).run_connection_health(shutdown.clone())),
            tokio::spawn(Arc::clone(self).run_liveness_health(shutdown)),
        ]
    }

    /// Wire up a freshly connected agent: create its bounded inbox, hand the
    /// sender to the coordinator and spawn the dispatch loop. Re-attaching
    /// replaces any previous connection.
    pub async fn attach(&self, agent_id: &str) {
        let (tx, rx) = mpsc::channel(self.config.agent_inbox_size.max(1));
        let in_flight = Arc::new(AtomicUsize::new(0));
        {
            let mut conns = self.connections.write().await;
            conns.insert(
                agent_id.to_string(),
                ConnectionHandle {
                    inbox_tx: tx.clone(),
                    in_flight: Arc::clone(&in_flight),
                    last_seen: Utc::now(),
                },
            );
        }
        self.coordinator.attach_inbox(agent_id, tx).await;
        tokio::spawn(Self::dispatch_loop(
            Arc::clone(&self.coordinator),
            Arc::clone(&self.frames),
            agent_id.to_string(),
            rx,
            in_flight,
        ));
        debug!(agent_id, "Agent connection attached");
    }

    /// Withdraw an agent's connection. Dropping the inbox senders ends its
    /// dispatch loop once the queue drains.
    pub async fn detach(&self, agent_id: &str) {
        self.coordinator.detach_inbox(agent_id).await;
        self.connections.write().await.remove(agent_id);
        debug!(agent_id, "Agent connection detached");
    }

    /// Refresh the connection-level liveness clock (heartbeats and any other
    /// inbound traffic).
    pub async fn touch(&self, agent_id: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(agent_id) {
            conn.last_seen = Utc::now();
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_stats(&self) -> Vec<ConnectionStats> {
        let conns = self.connections.read().await;
        conns
            .iter()
            .map(|(agent_id, conn)| ConnectionStats {
                agent_id: agent_id.clone(),
                inbox_depth: conn.inbox_tx.max_capacity() - conn.inbox_tx.capacity(),
                in_flight: conn.in_flight.load(Ordering::Relaxed),
                last_seen: conn.last_seen,
            })
            .collect()
    }

    /// One loop per connected agent: take the next task from the inbox and
    /// push its dispatch frame through the gateway. No lock is held across
    /// the send, and the loop never awaits the remote result — completion
    /// arrives through `Coordinator::complete_task` via the gateway handler.
    async fn dispatch_loop(
        coordinator: Arc<Coordinator>,
        frames: Arc<dyn FrameSink>,
        agent_id: String,
        mut inbox: mpsc::Receiver<Task>,
        in_flight: Arc<AtomicUsize>,
    ) {
        debug!(agent_id = %agent_id, "Starting dispatch loop");
        while let Some(task) = inbox.recv().await {
            // The task may have been cancelled between assignment and here.
            match coordinator.get_task(&task.id).await {
                Ok(current) if current.status == TaskStatus::Running => {}
                _ => {
                    debug!(task_id = %task.id, "Skipping dispatch of non-running task");
                    continue;
                }
            }

            let frame = Frame::new("task.dispatch", json!({ "task": task }));
            match frames.send_to_agent(&agent_id, frame).await {
                Ok(()) => {
                    in_flight.fetch_add(1, Ordering::Relaxed);
                    info!(task_id = %task.id, agent_id = %agent_id, "Task dispatched");
                }
                Err(e) => {
                    warn!(
                        task_id = %task.id,
                        agent_id = %agent_id,
                        error = %e,
                        "Dispatch delivery failed"
                    );
                    coordinator
                        .handle_transport_failure(&task.id, &agent_id)
                        .await;
                }
            }
        }
        debug!(agent_id = %agent_id, "Dispatch loop stopped");
    }

    async fn run_events(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self
            .coordinator
            .events()
            .subscribe("agent-manager", 256)
            .await;
        loop {
            tokio::select! {
                Some(event) = rx.recv() => self.observe_event(&event).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// A terminal outcome for a dispatched task means the agent answered (or
    /// was timed out): drop its in-flight count and refresh liveness.
    async fn observe_event(&self, event: &Event) {
        match event.event_type.as_str() {
            "task.completed" | "task.failed" | "task.timeout" | "task.cancelled" => {
                let Some(agent_id) = event.data.get("agent_id").and_then(|v| v.as_str()) else {
                    return;
                };
                if agent_id.is_empty() {
                    return;
                }
                let mut conns = self.connections.write().await;
                if let Some(conn) = conns.get_mut(agent_id) {
                    let _ = conn
                        .in_flight
                        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
                    if event.event_type == "task.completed" || event.event_type == "task.failed" {
                        conn.last_seen = Utc::now();
                    }
                }
            }
            _ => {}
        }
    }

    async fn run_connection_health(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(CONNECTION_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_connections().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Inbox-level check: a connected agent silent past the inactive
    /// threshold is downgraded to Offline. The connection itself stays open;
    /// the gateway owns the physical teardown.
    pub async fn check_connections(&self) {
        let threshold = chrono::Duration::from_std(self.config.agent_inactive_threshold())
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let stale: Vec<String> = {
            let conns = self.connections.read().await;
            conns
                .iter()
                .filter(|(_, conn)| now.signed_duration_since(conn.last_seen) > threshold)
                .map(|(agent_id, _)| agent_id.clone())
                .collect()
        };
        for agent_id in stale {
            warn!(agent_id = %agent_id, "Agent connection inactive, marking offline");
            self.coordinator.mark_agent_offline(&agent_id, false).await;
        }
    }

    async fn run_liveness_health(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(LIVENESS_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_liveness().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Global check: any agent past the dead threshold — connected or not —
    /// is forced Offline and its running tasks are failed with
    /// `agent_lost`.
    pub async fn check_liveness(&self) {
        let threshold = chrono::Duration::from_std(self.config.agent_dead_threshold())
            .unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        for agent in self.coordinator.list_agents().await {
            if now.signed_duration_since(agent.last_seen) > threshold {
                warn!(agent_id = %agent.id, "Agent passed dead threshold");
                let failed = self.coordinator.mark_agent_offline(&agent.id, true).await;
                if !failed.is_empty() {
                    warn!(
                        agent_id = %agent.id,
                        failed_tasks = failed.len(),
                        "Failed running tasks of dead agent"
                    );
                }
            }
        }
    }
}
