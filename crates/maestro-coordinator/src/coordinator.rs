use crate::events::EventBus;
use crate::queue::PendingQueue;
use chrono::{DateTime, Utc};
use maestro_core::{
    Agent, AgentStatus, Event, Frame, FrameSink, MaestroConfig, MaestroError, MaestroResult, Task,
    TaskStatus, Workflow, WorkflowStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Error string recorded on tasks whose agent vanished.
pub const ERR_AGENT_LOST: &str = "agent_lost";
/// Error string recorded on tasks whose dispatch frame could not be delivered.
pub const ERR_TRANSPORT_LOST: &str = "transport_lost";
/// Error string recorded on tasks that exceeded their timeout.
pub const ERR_TIMED_OUT: &str = "task execution timed out";

/// Everything behind the coordinator's single read-write lock: the three
/// entity maps, the agent registration order (matching is deterministic),
/// the inbox senders handed over by the agent manager, and the count of
/// Pending tasks backing the admission bound. No `.await` happens while a
/// guard on this is held.
struct Registry {
    agents: HashMap<String, Agent>,
    agent_order: Vec<String>,
    tasks: HashMap<String, Task>,
    workflows: HashMap<String, Workflow>,
    inboxes: HashMap<String, mpsc::Sender<Task>>,
    pending: usize,
}

/// Filter for task listings.
#[derive(Debug, Default, Clone)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub agent_id: Option<String>,
    pub workflow_id: Option<String>,
}

impl TaskFilter {
    fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status != status {
                return false;
            }
        }
        if let Some(agent_id) = &self.agent_id {
            if &task.agent_id != agent_id {
                return false;
            }
        }
        if let Some(workflow_id) = &self.workflow_id {
            if &task.workflow_id != workflow_id {
                return false;
            }
        }
        true
    }
}

/// Handed from `submit_task` to the matching loop.
struct Admission {
    id: String,
    priority: i32,
    created_at: DateTime<Utc>,
}

enum DispatchOutcome {
    /// Task is Running in some agent's inbox.
    Dispatched,
    /// No dispatchable agent (or its inbox is full); keep the task parked.
    NoAgent,
    /// Task no longer exists or already left Pending; drop the queue entry.
    Gone,
}

/// Counts reported on the metrics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
}

/// Partial update applied to a stored agent.
#[derive(Debug, Default, Clone)]
pub struct AgentUpdate {
    pub name: Option<String>,
    pub capabilities: Option<Vec<String>>,
    pub config: Option<HashMap<String, serde_json::Value>>,
    pub metadata: Option<HashMap<String, String>>,
    pub status: Option<AgentStatus>,
}

/// The authoritative arbiter of agent, task and workflow state. All state
/// transitions go through here; other components observe them via the event
/// bus or snapshot queries.
pub struct Coordinator {
    registry: RwLock<Registry>,
    events: EventBus,
    frames: Arc<dyn FrameSink>,
    config: MaestroConfig,
    queue_tx: mpsc::Sender<Admission>,
    queue_rx: Mutex<Option<mpsc::Receiver<Admission>>>,
    wake: Notify,
}

impl Coordinator {
    pub fn new(config: MaestroConfig, frames: Arc<dyn FrameSink>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(config.admission_queue_size.max(1));
        Arc::new(Self {
            registry: RwLock::new(Registry {
                agents: HashMap::new(),
                agent_order: Vec::new(),
                tasks: HashMap::new(),
                workflows: HashMap::new(),
                inboxes: HashMap::new(),
                pending: 0,
            }),
            events: EventBus::new(),
            frames,
            config,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            wake: Notify::new(),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &MaestroConfig {
        &self.config
    }

    /// Spawn the matching loop and the timeout sweeper. Both run until the
    /// shutdown signal flips.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Starting coordinator");
        vec![
            tokio::spawn(Arc::clone(self).run_matcher(shutdown.clone())),
            tokio::spawn(Arc::clone(self).run_sweeper(shutdown)),
        ]
    }

    // --- agents ---

    /// Register (or re-register) an agent. Registration resets the agent to
    /// Idle and refreshes its liveness clock.
    pub async fn register_agent(&self, mut agent: Agent) -> MaestroResult<Agent> {
        if agent.id.is_empty() {
            agent.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        agent.status = AgentStatus::Idle;
        agent.last_seen = now;
        agent.updated_at = now;

        let snapshot = {
            let mut reg = self.registry.write().await;
            if let Some(existing) = reg.agents.get(&agent.id) {
                agent.created_at = existing.created_at;
            } else {
                agent.created_at = now;
                reg.agent_order.push(agent.id.clone());
            }
            reg.agents.insert(agent.id.clone(), agent.clone());
            agent
        };

        info!(
            agent_id = %snapshot.id,
            name = %snapshot.name,
            capabilities = ?snapshot.capabilities,
            "Agent registered"
        );
        self.events
            .emit(Event::new(
                "agent.registered",
                json!({
                    "agent_id": snapshot.id,
                    "name": snapshot.name,
                    "capabilities": snapshot.capabilities,
                }),
            ))
            .await;
        self.wake.notify_one();
        Ok(snapshot)
    }

    /// Remove an agent. Its Running tasks are failed with `agent_lost`; an
    /// unknown id is silently ignored.
    pub async fn unregister_agent(&self, agent_id: &str) {
        let mut events = Vec::new();
        {
            let mut reg = self.registry.write().await;
            if reg.agents.remove(agent_id).is_none() {
                return;
            }
            reg.agent_order.retain(|id| id != agent_id);
            reg.inboxes.remove(agent_id);

            let now = Utc::now();
            for task in reg.tasks.values_mut() {
                if task.status == TaskStatus::Running && task.agent_id == agent_id {
                    task.status = TaskStatus::Failed;
                    task.error = ERR_AGENT_LOST.to_string();
                    task.completed_at = Some(now);
                    events.push(task_event("task.failed", task));
                }
            }
            events.push(Event::new(
                "agent.unregistered",
                json!({ "agent_id": agent_id }),
            ));
        }
        info!(agent_id, "Agent unregistered");
        for event in events {
            self.events.emit(event).await;
        }
    }

    /// Apply a status update. An unknown id is silently ignored. A
    /// heartbeat-driven `Active` never downgrades a Busy agent — that would
    /// break the Busy ⇔ running-task invariant — but it always refreshes
    /// the liveness clock.
    pub async fn update_agent_status(&self, agent_id: &str, status: AgentStatus) {
        let dispatchable = {
            let mut reg = self.registry.write().await;
            let Some(agent) = reg.agents.get_mut(agent_id) else {
                return;
            };
            let now = Utc::now();
            agent.last_seen = now;
            agent.updated_at = now;
            if !(status == AgentStatus::Active && agent.status == AgentStatus::Busy) {
                agent.status = status;
            }
            agent.status.is_dispatchable()
        };
        debug!(agent_id, status = %status, "Agent status updated");
        if dispatchable {
            self.wake.notify_one();
        }
    }

    /// Partial update of a stored agent (operational surface).
    pub async fn update_agent(&self, agent_id: &str, update: AgentUpdate) -> MaestroResult<Agent> {
        let snapshot = {
            let mut reg = self.registry.write().await;
            let agent = reg
                .agents
                .get_mut(agent_id)
                .ok_or_else(|| MaestroError::not_found("agent", agent_id))?;
            if let Some(name) = update.name {
                agent.name = name;
            }
            if let Some(capabilities) = update.capabilities {
                agent.capabilities = capabilities;
            }
            if let Some(config) = update.config {
                agent.config = config;
            }
            if let Some(metadata) = update.metadata {
                agent.metadata = metadata;
            }
            if let Some(status) = update.status {
                agent.status = status;
            }
            agent.updated_at = Utc::now();
            agent.clone()
        };
        if snapshot.status.is_dispatchable() {
            self.wake.notify_one();
        }
        Ok(snapshot)
    }

    pub async fn get_agent(&self, agent_id: &str) -> MaestroResult<Agent> {
        let reg = self.registry.read().await;
        reg.agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| MaestroError::not_found("agent", agent_id))
    }

    /// All agents in registration order.
    pub async fn list_agents(&self) -> Vec<Agent> {
        let reg = self.registry.read().await;
        reg.agent_order
            .iter()
            .filter_map(|id| reg.agents.get(id).cloned())
            .collect()
    }

    /// Force an agent Offline, optionally failing its Running tasks with
    /// `agent_lost`. Returns the ids of the failed tasks.
    pub async fn mark_agent_offline(&self, agent_id: &str, fail_tasks: bool) -> Vec<String> {
        let mut events = Vec::new();
        let mut failed = Vec::new();
        {
            let mut reg = self.registry.write().await;
            let Some(agent) = reg.agents.get_mut(agent_id) else {
                return failed;
            };
            agent.status = AgentStatus::Offline;
            agent.updated_at = Utc::now();

            if fail_tasks {
                let now = Utc::now();
                for task in reg.tasks.values_mut() {
                    if task.status == TaskStatus::Running && task.agent_id == agent_id {
                        task.status = TaskStatus::Failed;
                        task.error = ERR_AGENT_LOST.to_string();
                        task.completed_at = Some(now);
                        events.push(task_event("task.failed", task));
                        failed.push(task.id.clone());
                    }
                }
            }
        }
        for event in events {
            self.events.emit(event).await;
        }
        failed
    }

    /// Register the inbox sender for a connected agent. The agent manager
    /// owns the queue; the coordinator only pushes into it during matching.
    pub async fn attach_inbox(&self, agent_id: &str, tx: mpsc::Sender<Task>) {
        self.registry
            .write()
            .await
            .inboxes
            .insert(agent_id.to_string(), tx);
        self.wake.notify_one();
    }

    pub async fn detach_inbox(&self, agent_id: &str) {
        self.registry.write().await.inboxes.remove(agent_id);
    }

    // --- tasks ---

    /// Admit a task. Fills defaults, enforces the admission bound and hands
    /// the task to the matching loop. Returns the accepted snapshot.
    pub async fn submit_task(&self, mut task: Task) -> MaestroResult<Task> {
        if task.task_type.is_empty() {
            return Err(MaestroError::Invalid("task type must not be empty".into()));
        }
        if task.id.is_empty() {
            task.id = Uuid::new_v4().to_string();
        }
        task.status = TaskStatus::Pending;
        task.created_at = Utc::now();
        task.started_at = None;
        task.completed_at = None;
        if task.timeout.is_zero() {
            task.timeout = self.config.task_timeout();
        }

        let admission = {
            let mut reg = self.registry.write().await;
            if reg.pending >= self.config.admission_queue_size {
                return Err(MaestroError::QueueFull("admission queue"));
            }
            if reg.tasks.contains_key(&task.id) {
                return Err(MaestroError::Invalid(format!(
                    "task id {} already in use",
                    task.id
                )));
            }
            reg.tasks.insert(task.id.clone(), task.clone());
            reg.pending += 1;
            Admission {
                id: task.id.clone(),
                priority: task.priority,
                created_at: task.created_at,
            }
        };

        if self.queue_tx.try_send(admission).is_err() {
            let mut reg = self.registry.write().await;
            reg.tasks.remove(&task.id);
            reg.pending = reg.pending.saturating_sub(1);
            return Err(MaestroError::QueueFull("admission queue"));
        }

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority,
            "Task submitted"
        );
        self.events
            .emit(Event::new(
                "task.submitted",
                json!({ "task_id": task.id, "type": task.task_type }),
            ))
            .await;
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> MaestroResult<Task> {
        let reg = self.registry.read().await;
        reg.tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| MaestroError::not_found("task", task_id))
    }

    /// Snapshot of matching tasks, oldest first.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        let reg = self.registry.read().await;
        let mut tasks: Vec<Task> = reg
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    /// Record a result reported by the owning agent. Only a Running task may
    /// complete; duplicates against terminal tasks surface as
    /// `InvalidState` for the caller to log and drop (first completion
    /// wins).
    pub async fn complete_task(
        &self,
        task_id: &str,
        result: HashMap<String, serde_json::Value>,
        success: bool,
        error: Option<String>,
    ) -> MaestroResult<Task> {
        let (snapshot, event) = {
            let mut reg = self.registry.write().await;
            let task = reg
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| MaestroError::not_found("task", task_id))?;
            if task.status != TaskStatus::Running {
                return Err(MaestroError::invalid_state(task_id, task.status));
            }
            let now = Utc::now();
            task.result = result;
            task.completed_at = Some(now);
            if success {
                task.status = TaskStatus::Completed;
            } else {
                task.status = TaskStatus::Failed;
                task.error = error.unwrap_or_else(|| "task failed".to_string());
            }
            let event = task_event(
                if success { "task.completed" } else { "task.failed" },
                task,
            );
            let snapshot = task.clone();
            let agent_id = snapshot.agent_id.clone();

            if let Some(agent) = reg.agents.get_mut(&agent_id) {
                if agent.status == AgentStatus::Busy {
                    agent.status = AgentStatus::Idle;
                }
                let now = Utc::now();
                agent.last_seen = now;
                agent.updated_at = now;
            }
            (snapshot, event)
        };

        info!(
            task_id,
            agent_id = %snapshot.agent_id,
            status = %snapshot.status,
            "Task completed"
        );
        self.events.emit(event).await;
        self.wake.notify_one();
        Ok(snapshot)
    }

    /// Cancel a task. Pending tasks cancel immediately; Running tasks cancel
    /// and the owning agent receives a best-effort `task.cancel` frame.
    /// Terminal tasks yield `InvalidState` (cancellation is idempotent in
    /// effect, never a double transition).
    pub async fn cancel_task(&self, task_id: &str) -> MaestroResult<Task> {
        let (snapshot, event, notify_agent) = {
            let mut reg = self.registry.write().await;
            let task = reg
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| MaestroError::not_found("task", task_id))?;
            let now = Utc::now();
            let notify_agent = match task.status {
                TaskStatus::Pending => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(now);
                    None
                }
                TaskStatus::Running => {
                    task.status = TaskStatus::Cancelled;
                    task.completed_at = Some(now);
                    Some(task.agent_id.clone())
                }
                status => return Err(MaestroError::invalid_state(task_id, status)),
            };
            let event = task_event("task.cancelled", task);
            let snapshot = task.clone();

            match &notify_agent {
                None => reg.pending = reg.pending.saturating_sub(1),
                Some(agent_id) => {
                    if let Some(agent) = reg.agents.get_mut(agent_id) {
                        if agent.status == AgentStatus::Busy {
                            agent.status = AgentStatus::Idle;
                        }
                        agent.updated_at = now;
                    }
                }
            }
            (snapshot, event, notify_agent)
        };

        info!(task_id, "Task cancelled");
        if let Some(agent_id) = notify_agent {
            let frame = Frame::new(
                "task.cancel",
                json!({ "task_id": task_id, "reason": "cancelled" }),
            );
            if let Err(e) = self.frames.send_to_agent(&agent_id, frame).await {
                debug!(task_id, agent_id = %agent_id, error = %e, "Cancel frame not delivered");
            }
            self.wake.notify_one();
        }
        self.events.emit(event).await;
        Ok(snapshot)
    }

    /// A dispatch frame for this task could not be delivered: the task is
    /// failed with `transport_lost` and the agent is forced Offline.
    pub async fn handle_transport_failure(&self, task_id: &str, agent_id: &str) {
        let mut events = Vec::new();
        {
            let mut reg = self.registry.write().await;
            let now = Utc::now();
            if let Some(task) = reg.tasks.get_mut(task_id) {
                if task.status == TaskStatus::Running {
                    task.status = TaskStatus::Failed;
                    task.error = ERR_TRANSPORT_LOST.to_string();
                    task.completed_at = Some(now);
                    events.push(task_event("task.failed", task));
                }
            }
            if let Some(agent) = reg.agents.get_mut(agent_id) {
                agent.status = AgentStatus::Offline;
                agent.updated_at = now;
            }
        }
        warn!(task_id, agent_id, "Task failed: transport lost");
        for event in events {
            self.events.emit(event).await;
        }
    }

    /// Store a synthesized terminal task record (used by the workflow engine
    /// for steps skipped under `continue_on_error`).
    pub async fn insert_cancelled_task(&self, mut task: Task) -> Task {
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        let event = task_event("task.cancelled", &task);
        {
            let mut reg = self.registry.write().await;
            reg.tasks.insert(task.id.clone(), task.clone());
        }
        self.events.emit(event).await;
        task
    }

    pub async fn task_counts(&self) -> TaskCounts {
        let reg = self.registry.read().await;
        TaskCounts {
            pending: reg.pending,
            running: reg
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Running)
                .count(),
        }
    }

    // --- workflows ---

    /// Validate and store a workflow in Draft. A cyclic dependency graph is
    /// rejected with `Invalid` and leaves no partial state.
    pub async fn submit_workflow(&self, mut workflow: Workflow) -> MaestroResult<Workflow> {
        workflow.validate()?;
        if workflow.id.is_empty() {
            workflow.id = Uuid::new_v4().to_string();
        }
        workflow.status = WorkflowStatus::Draft;
        let now = Utc::now();
        workflow.created_at = now;
        workflow.updated_at = now;

        {
            let mut reg = self.registry.write().await;
            if reg.workflows.contains_key(&workflow.id) {
                return Err(MaestroError::Invalid(format!(
                    "workflow id {} already in use",
                    workflow.id
                )));
            }
            reg.workflows.insert(workflow.id.clone(), workflow.clone());
        }
        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            steps = workflow.steps.len(),
            "Workflow submitted"
        );
        Ok(workflow)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> MaestroResult<Workflow> {
        let reg = self.registry.read().await;
        reg.workflows
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| MaestroError::not_found("workflow", workflow_id))
    }

    pub async fn list_workflows(&self) -> Vec<Workflow> {
        let reg = self.registry.read().await;
        let mut workflows: Vec<Workflow> = reg.workflows.values().cloned().collect();
        workflows.sort_by_key(|w| w.created_at);
        workflows
    }

    /// Atomically move a Draft workflow to Active and return the snapshot.
    pub async fn begin_workflow(&self, workflow_id: &str) -> MaestroResult<Workflow> {
        let snapshot = {
            let mut reg = self.registry.write().await;
            let workflow = reg
                .workflows
                .get_mut(workflow_id)
                .ok_or_else(|| MaestroError::not_found("workflow", workflow_id))?;
            if workflow.status != WorkflowStatus::Draft {
                return Err(MaestroError::invalid_state(workflow_id, workflow.status));
            }
            workflow.status = WorkflowStatus::Active;
            workflow.updated_at = Utc::now();
            workflow.clone()
        };
        self.events
            .emit(Event::new(
                "workflow.started",
                json!({ "workflow_id": workflow_id }),
            ))
            .await;
        Ok(snapshot)
    }

    /// Apply a terminal (or Paused) status to a workflow; the engine is the
    /// only caller.
    pub async fn set_workflow_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> MaestroResult<Workflow> {
        let snapshot = {
            let mut reg = self.registry.write().await;
            let workflow = reg
                .workflows
                .get_mut(workflow_id)
                .ok_or_else(|| MaestroError::not_found("workflow", workflow_id))?;
            workflow.status = status;
            workflow.updated_at = Utc::now();
            workflow.clone()
        };
        let event_type = match status {
            WorkflowStatus::Completed => Some("workflow.completed"),
            WorkflowStatus::Failed => Some("workflow.failed"),
            _ => None,
        };
        if let Some(event_type) = event_type {
            self.events
                .emit(Event::new(event_type, json!({ "workflow_id": workflow_id })))
                .await;
        }
        Ok(snapshot)
    }

    // --- internal loops ---

    async fn run_matcher(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut queue_rx) = self.queue_rx.lock().await.take() else {
            error!("Matching loop already started");
            return;
        };
        let mut pending = PendingQueue::new();
        loop {
            tokio::select! {
                Some(admission) = queue_rx.recv() => {
                    pending.push(admission.id, admission.priority, admission.created_at);
                    self.drain(&mut pending).await;
                }
                _ = self.wake.notified() => {
                    pending.unpark_all();
                    self.drain(&mut pending).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Matching loop stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One matching pass: pop every queued candidate in priority order,
    /// dispatch the matchable ones and park the rest. An unmatchable head
    /// never blocks the tasks behind it.
    async fn drain(&self, pending: &mut PendingQueue) {
        let mut parked = Vec::new();
        while let Some(candidate) = pending.pop() {
            match self.try_dispatch(&candidate.id).await {
                DispatchOutcome::Dispatched | DispatchOutcome::Gone => {}
                DispatchOutcome::NoAgent => parked.push(candidate),
            }
        }
        for candidate in parked {
            pending.park(candidate);
        }
    }

    async fn try_dispatch(&self, task_id: &str) -> DispatchOutcome {
        let (outcome, events) = {
            let mut reg = self.registry.write().await;
            let mut events = Vec::new();
            let outcome = dispatch_locked(&mut reg, task_id, &mut events);
            (outcome, events)
        };
        for event in events {
            self.events.emit(event).await;
        }
        outcome
    }

    async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_timeouts().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Timeout sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Expire every Running task whose elapsed time exceeds its timeout.
    /// The owning agent returns to Idle and receives a best-effort cancel
    /// frame so it stops doing work.
    pub async fn sweep_timeouts(&self) {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut cancels = Vec::new();
        {
            let mut reg = self.registry.write().await;
            let expired: Vec<String> = reg
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::Running
                        && t.started_at.is_some_and(|started| {
                            now.signed_duration_since(started)
                                > chrono::Duration::from_std(t.timeout)
                                    .unwrap_or(chrono::Duration::MAX)
                        })
                })
                .map(|t| t.id.clone())
                .collect();

            for task_id in expired {
                let Some(task) = reg.tasks.get_mut(&task_id) else {
                    continue;
                };
                warn!(
                    task_id = %task_id,
                    timeout_secs = task.timeout.as_secs(),
                    "Task timed out"
                );
                task.status = TaskStatus::TimedOut;
                task.error = ERR_TIMED_OUT.to_string();
                task.completed_at = Some(now);
                let agent_id = task.agent_id.clone();
                events.push(task_event("task.timeout", task));

                if let Some(agent) = reg.agents.get_mut(&agent_id) {
                    if agent.status == AgentStatus::Busy {
                        agent.status = AgentStatus::Idle;
                    }
                    agent.updated_at = now;
                }
                cancels.push((agent_id, task_id));
            }
        }

        let freed = !cancels.is_empty();
        for (agent_id, task_id) in cancels {
            let frame = Frame::new(
                "task.cancel",
                json!({ "task_id": task_id, "reason": "timeout" }),
            );
            if let Err(e) = self.frames.send_to_agent(&agent_id, frame).await {
                debug!(task_id = %task_id, agent_id = %agent_id, error = %e, "Cancel frame not delivered");
            }
        }
        for event in events {
            self.events.emit(event).await;
        }
        if freed {
            self.wake.notify_one();
        }
    }
}

/// Matching rule, evaluated under the registry lock: a pinned task requires
/// its exact agent to be dispatchable; otherwise the first dispatchable
/// agent (registration order) whose capabilities contain the task type
/// wins. The task is handed over with a reserved inbox slot, so there is
/// nothing to roll back on a full inbox.
fn dispatch_locked(
    reg: &mut Registry,
    task_id: &str,
    events: &mut Vec<Event>,
) -> DispatchOutcome {
    let (pinned, task_type) = match reg.tasks.get(task_id) {
        Some(task) if task.status == TaskStatus::Pending => {
            (task.agent_id.clone(), task.task_type.clone())
        }
        _ => return DispatchOutcome::Gone,
    };

    let selected = if !pinned.is_empty() {
        reg.agents
            .get(&pinned)
            .filter(|a| a.status.is_dispatchable())
            .map(|a| a.id.clone())
    } else {
        reg.agent_order
            .iter()
            .find(|id| {
                reg.agents
                    .get(*id)
                    .is_some_and(|a| a.status.is_dispatchable() && a.has_capability(&task_type))
            })
            .cloned()
    };
    let Some(agent_id) = selected else {
        debug!(task_id, task_type = %task_type, "No available agent for task");
        return DispatchOutcome::NoAgent;
    };

    let Some(inbox) = reg.inboxes.get(&agent_id).cloned() else {
        // Registered but not connected (e.g. created over REST only).
        return DispatchOutcome::NoAgent;
    };
    let Ok(permit) = inbox.try_reserve() else {
        return DispatchOutcome::NoAgent;
    };

    let now = Utc::now();
    let snapshot = {
        let Some(task) = reg.tasks.get_mut(task_id) else {
            return DispatchOutcome::Gone;
        };
        task.agent_id = agent_id.clone();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.clone()
    };
    if let Some(agent) = reg.agents.get_mut(&agent_id) {
        agent.status = AgentStatus::Busy;
        agent.last_seen = now;
        agent.updated_at = now;
    }
    reg.pending = reg.pending.saturating_sub(1);

    info!(task_id, agent_id = %agent_id, task_type = %task_type, "Task assigned to agent");
    events.push(Event::new(
        "task.assigned",
        json!({ "task_id": task_id, "agent_id": agent_id }),
    ));
    permit.send(snapshot);
    DispatchOutcome::Dispatched
}

fn task_event(event_type: &str, task: &Task) -> Event {
    Event::new(
        event_type,
        json!({
            "task_id": task.id,
            "agent_id": task.agent_id,
            "workflow_id": task.workflow_id,
            "status": task.status,
            "error": task.error,
        }),
    )
}
