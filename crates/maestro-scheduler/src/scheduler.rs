use chrono::{DateTime, Utc};
use maestro_coordinator::Coordinator;
use maestro_core::{
    MaestroError, MaestroResult, Schedule, ScheduleTarget, Task, Workflow, WorkflowStep,
};
use maestro_workflow::WorkflowEngine;
use serde::Deserialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Sleep when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_secs(60);
/// Entries within this window of "now" fire in the same pass.
const FIRE_TOLERANCE: chrono::Duration = chrono::Duration::seconds(1);

/// Task description carried in a schedule payload under the `task` key.
#[derive(Debug, Deserialize)]
struct TaskSpec {
    #[serde(rename = "type")]
    task_type: String,
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    payload: HashMap<String, serde_json::Value>,
    #[serde(default)]
    timeout_secs: u64,
}

/// Workflow step description inside a `workflow` schedule payload.
#[derive(Debug, Deserialize)]
struct StepSpec {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    step_type: String,
    #[serde(default)]
    agent: String,
    #[serde(default)]
    payload: HashMap<String, serde_json::Value>,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    timeout_secs: u64,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Workflow description carried in a schedule payload under the `workflow`
/// key.
#[derive(Debug, Deserialize)]
struct WorkflowSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

/// Partial update applied to a stored schedule.
#[derive(Debug, Default, Clone)]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub cron: Option<String>,
    pub enabled: Option<bool>,
    pub payload: Option<HashMap<String, serde_json::Value>>,
}

/// Fires schedule entries at their cron times. Owns the schedule map; due
/// entries live in a min-heap keyed by `next_run` with lazy invalidation —
/// a popped entry that disagrees with the map (removed, disabled or
/// re-cronned schedule) is simply discarded.
pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    engine: Arc<WorkflowEngine>,
    schedules: RwLock<HashMap<String, Schedule>>,
    due: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, String)>>>,
    wake: Notify,
}

impl Scheduler {
    pub fn new(coordinator: Arc<Coordinator>, engine: Arc<WorkflowEngine>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            engine,
            schedules: RwLock::new(HashMap::new()),
            due: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        })
    }

    /// Parse a cron expression (seconds resolution: sec min hour
    /// day-of-month month day-of-week [year]).
    pub fn parse_cron(expr: &str) -> MaestroResult<cron::Schedule> {
        cron::Schedule::from_str(expr)
            .map_err(|e| MaestroError::Invalid(format!("invalid cron expression '{expr}': {e}")))
    }

    /// First fire time after `from`, or `Invalid` when the expression never
    /// fires again.
    pub fn next_fire_time(expr: &str, from: DateTime<Utc>) -> MaestroResult<DateTime<Utc>> {
        let schedule = Self::parse_cron(expr)?;
        schedule.after(&from).next().ok_or_else(|| {
            MaestroError::Invalid(format!("cron expression '{expr}' has no upcoming fire times"))
        })
    }

    /// Register a schedule. The cron expression is validated here; malformed
    /// expressions are rejected and nothing is stored.
    pub async fn add_schedule(&self, mut schedule: Schedule) -> MaestroResult<Schedule> {
        let next = Self::next_fire_time(&schedule.cron, Utc::now())?;
        if schedule.id.is_empty() {
            schedule.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        schedule.created_at = now;
        schedule.updated_at = now;
        schedule.last_run = None;
        schedule.next_run = Some(next);

        {
            let mut schedules = self.schedules.write().await;
            schedules.insert(schedule.id.clone(), schedule.clone());
        }
        self.due
            .lock()
            .await
            .push(Reverse((next, schedule.id.clone())));
        self.wake.notify_one();

        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            cron = %schedule.cron,
            next_run = %next,
            "Schedule added"
        );
        Ok(schedule)
    }

    /// Remove a schedule. Unknown ids are silently ignored; any heap entry
    /// for it is invalidated lazily.
    pub async fn remove_schedule(&self, schedule_id: &str) {
        if self
            .schedules
            .write()
            .await
            .remove(schedule_id)
            .is_some()
        {
            info!(schedule_id, "Schedule removed");
        }
    }

    /// Apply a partial update. A new cron expression is validated and
    /// `next_run` recomputed; disabling keeps the schedule but stops it
    /// firing.
    pub async fn update_schedule(
        &self,
        schedule_id: &str,
        update: ScheduleUpdate,
    ) -> MaestroResult<Schedule> {
        let (snapshot, new_entry) = {
            let mut schedules = self.schedules.write().await;
            let schedule = schedules
                .get_mut(schedule_id)
                .ok_or_else(|| MaestroError::not_found("schedule", schedule_id))?;

            if let Some(cron_expr) = update.cron {
                let next = Self::next_fire_time(&cron_expr, Utc::now())?;
                schedule.cron = cron_expr;
                schedule.next_run = Some(next);
            }
            if let Some(name) = update.name {
                schedule.name = name;
            }
            if let Some(payload) = update.payload {
                schedule.payload = payload;
            }
            if let Some(enabled) = update.enabled {
                schedule.enabled = enabled;
                if enabled && schedule.next_run.is_none() {
                    schedule.next_run = Some(Self::next_fire_time(&schedule.cron, Utc::now())?);
                }
            }
            schedule.updated_at = Utc::now();
            let entry = schedule
                .next_run
                .filter(|_| schedule.enabled)
                .map(|at| (at, schedule.id.clone()));
            (schedule.clone(), entry)
        };

        if let Some(entry) = new_entry {
            self.due.lock().await.push(Reverse(entry));
            self.wake.notify_one();
        }
        info!(schedule_id, enabled = snapshot.enabled, "Schedule updated");
        Ok(snapshot)
    }

    pub async fn get_schedule(&self, schedule_id: &str) -> MaestroResult<Schedule> {
        self.schedules
            .read()
            .await
            .get(schedule_id)
            .cloned()
            .ok_or_else(|| MaestroError::not_found("schedule", schedule_id))
    }

    pub async fn list_schedules(&self) -> Vec<Schedule> {
        let schedules = self.schedules.read().await;
        let mut all: Vec<Schedule> = schedules.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Spawn the tick loop: sleep until the soonest due entry (or a
    /// mutation wakes us), fire everything due, repeat.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!("Starting scheduler");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = this.time_to_next().await;
                tokio::select! {
                    _ = tokio::time::sleep(wait) => this.fire_due().await,
                    _ = this.wake.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Scheduler stopping");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Time until the soonest valid heap entry, discarding stale entries on
    /// the way.
    async fn time_to_next(&self) -> Duration {
        let schedules = self.schedules.read().await;
        let mut due = self.due.lock().await;
        while let Some(Reverse((at, id))) = due.peek().cloned() {
            let valid = schedules
                .get(&id)
                .is_some_and(|s| s.enabled && s.next_run == Some(at));
            if !valid {
                due.pop();
                continue;
            }
            let now = Utc::now();
            return (at - now).to_std().unwrap_or(Duration::ZERO);
        }
        IDLE_WAIT
    }

    /// Fire every entry due within the tolerance window.
    pub async fn fire_due(&self) {
        let threshold = Utc::now() + FIRE_TOLERANCE;
        loop {
            let entry = {
                let mut due = self.due.lock().await;
                match due.peek() {
                    Some(Reverse((at, _))) if *at <= threshold => due.pop(),
                    _ => None,
                }
            };
            let Some(Reverse((at, id))) = entry else {
                break;
            };

            let schedule = {
                let schedules = self.schedules.read().await;
                schedules.get(&id).cloned()
            };
            let Some(schedule) = schedule else {
                continue; // removed since the entry was pushed
            };
            if !schedule.enabled || schedule.next_run != Some(at) {
                continue; // stale entry
            }
            self.fire_schedule(schedule).await;
        }
    }

    /// Fire one schedule: advance its clock, synthesize the target and
    /// submit it. Admission failures are logged and skipped, never retried
    /// within the same tick.
    async fn fire_schedule(&self, schedule: Schedule) {
        let now = Utc::now();
        info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            target = ?schedule.target,
            "Executing schedule"
        );

        let next = match Self::next_fire_time(&schedule.cron, now) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "No further fire times");
                None
            }
        };
        {
            let mut schedules = self.schedules.write().await;
            if let Some(stored) = schedules.get_mut(&schedule.id) {
                stored.last_run = Some(now);
                stored.next_run = next;
                stored.updated_at = now;
            }
        }
        if let Some(next) = next {
            self.due.lock().await.push(Reverse((next, schedule.id.clone())));
        }

        match schedule.target {
            ScheduleTarget::Task => self.fire_task(&schedule).await,
            ScheduleTarget::Workflow => self.fire_workflow(&schedule).await,
        }
    }

    async fn fire_task(&self, schedule: &Schedule) {
        let Some(spec) = schedule.payload.get("task") else {
            warn!(schedule_id = %schedule.id, "Schedule payload has no task object");
            return;
        };
        let spec: TaskSpec = match serde_json::from_value(spec.clone()) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Invalid task payload in schedule");
                return;
            }
        };

        let mut task = Task::new(spec.task_type, spec.priority, spec.payload);
        if !spec.agent_id.is_empty() {
            task = task.with_agent(spec.agent_id);
        }
        if spec.timeout_secs > 0 {
            task = task.with_timeout(Duration::from_secs(spec.timeout_secs));
        }

        match self.coordinator.submit_task(task).await {
            Ok(task) => {
                info!(schedule_id = %schedule.id, task_id = %task.id, "Created scheduled task");
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Scheduled task submission failed");
            }
        }
    }

    async fn fire_workflow(&self, schedule: &Schedule) {
        let Some(spec) = schedule.payload.get("workflow") else {
            warn!(schedule_id = %schedule.id, "Schedule payload has no workflow object");
            return;
        };
        let spec: WorkflowSpec = match serde_json::from_value(spec.clone()) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Invalid workflow payload in schedule");
                return;
            }
        };

        let mut workflow = Workflow::new(spec.name, spec.description);
        for step_spec in spec.steps {
            let mut step = WorkflowStep::new(step_spec.step_type)
                .with_payload(step_spec.payload)
                .depends_on(step_spec.depends_on);
            if !step_spec.id.is_empty() {
                step = step.with_id(step_spec.id);
            }
            if !step_spec.agent.is_empty() {
                step = step.with_agent(step_spec.agent);
            }
            if step_spec.timeout_secs > 0 {
                step = step.with_timeout(Duration::from_secs(step_spec.timeout_secs));
            }
            step.parallel = step_spec.parallel;
            workflow.add_step(step);
        }

        let workflow = match self.coordinator.submit_workflow(workflow).await {
            Ok(workflow) => workflow,
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Scheduled workflow submission failed");
                return;
            }
        };
        match self.engine.execute(&workflow.id).await {
            Ok(_) => {
                info!(
                    schedule_id = %schedule.id,
                    workflow_id = %workflow.id,
                    "Created scheduled workflow"
                );
            }
            Err(e) => {
                warn!(schedule_id = %schedule.id, error = %e, "Scheduled workflow execution failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maestro_core::{Frame, FrameSink, MaestroConfig, TaskStatus, WorkflowStatus};
    use serde_json::json;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send_to_agent(&self, _agent_id: &str, _frame: Frame) -> MaestroResult<()> {
            Ok(())
        }
    }

    fn scheduler() -> (Arc<Scheduler>, Arc<Coordinator>) {
        let coordinator = Coordinator::new(MaestroConfig::default(), Arc::new(NullSink));
        let engine = WorkflowEngine::new(Arc::clone(&coordinator));
        (Scheduler::new(Arc::clone(&coordinator), engine), coordinator)
    }

    #[test]
    fn test_parse_valid_cron() {
        assert!(Scheduler::parse_cron("0 * * * * *").is_ok());
        assert!(Scheduler::parse_cron("0 0 3 * * * *").is_ok());
    }

    #[test]
    fn test_parse_invalid_cron() {
        let err = Scheduler::parse_cron("not a cron expression").unwrap_err();
        assert!(matches!(err, MaestroError::Invalid(_)));
    }

    #[test]
    fn test_next_fire_time_is_future() {
        let now = Utc::now();
        let next = Scheduler::next_fire_time("* * * * * *", now).unwrap();
        assert!(next > now);
    }

    #[tokio::test]
    async fn test_add_schedule_rejects_malformed_cron() {
        let (scheduler, _) = scheduler();
        let err = scheduler
            .add_schedule(Schedule::new(
                "broken",
                ScheduleTarget::Task,
                "banana",
                HashMap::new(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, MaestroError::Invalid(_)));
        assert!(scheduler.list_schedules().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_schedule_computes_next_run() {
        let (scheduler, _) = scheduler();
        let stored = scheduler
            .add_schedule(Schedule::new(
                "hourly",
                ScheduleTarget::Task,
                "0 0 * * * *",
                HashMap::new(),
            ))
            .await
            .unwrap();
        assert!(stored.next_run.unwrap() > Utc::now());
        assert!(stored.last_run.is_none());
    }

    #[tokio::test]
    async fn test_disabled_schedule_does_not_fire() {
        let (scheduler, coordinator) = scheduler();
        let mut payload = HashMap::new();
        payload.insert("task".to_string(), json!({"type": "code"}));
        let stored = scheduler
            .add_schedule(Schedule::new(
                "off",
                ScheduleTarget::Task,
                "* * * * * *",
                payload,
            ))
            .await
            .unwrap();
        scheduler
            .update_schedule(
                &stored.id,
                ScheduleUpdate {
                    enabled: Some(false),
                    ..ScheduleUpdate::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        scheduler.fire_due().await;
        assert!(coordinator.list_tasks(&Default::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_fire_task_schedule_submits_task() {
        let (scheduler, coordinator) = scheduler();
        let mut payload = HashMap::new();
        payload.insert(
            "task".to_string(),
            json!({"type": "code", "priority": 2, "timeout_secs": 5}),
        );
        let stored = scheduler
            .add_schedule(Schedule::new(
                "every-second",
                ScheduleTarget::Task,
                "* * * * * *",
                payload,
            ))
            .await
            .unwrap();

        scheduler.fire_schedule(stored).await;

        let tasks = coordinator.list_tasks(&Default::default()).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, "code");
        assert_eq!(tasks[0].priority, 2);
        assert_eq!(tasks[0].status, TaskStatus::Pending);

        let after = scheduler.list_schedules().await.remove(0);
        let last_run = after.last_run.unwrap();
        assert!(after.next_run.unwrap() > last_run);
    }

    #[tokio::test]
    async fn test_fire_workflow_schedule_creates_active_workflow() {
        let (scheduler, coordinator) = scheduler();
        let mut payload = HashMap::new();
        payload.insert(
            "workflow".to_string(),
            json!({
                "name": "nightly-report",
                "steps": [
                    {"id": "s1", "type": "extract"},
                    {"id": "s2", "type": "report", "depends_on": ["s1"]}
                ]
            }),
        );
        let stored = scheduler
            .add_schedule(Schedule::new(
                "nightly",
                ScheduleTarget::Workflow,
                "0 0 3 * * *",
                payload,
            ))
            .await
            .unwrap();

        scheduler.fire_schedule(stored).await;

        let workflows = coordinator.list_workflows().await;
        assert_eq!(workflows.len(), 1);
        assert_eq!(workflows[0].status, WorkflowStatus::Active);
        assert_eq!(workflows[0].steps.len(), 2);

        // The dependency-free step was submitted as a task.
        let tasks = coordinator.list_tasks(&Default::default()).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, "extract");
    }

    #[tokio::test]
    async fn test_bad_payload_is_logged_and_skipped() {
        let (scheduler, coordinator) = scheduler();
        let stored = scheduler
            .add_schedule(Schedule::new(
                "empty",
                ScheduleTarget::Task,
                "* * * * * *",
                HashMap::new(),
            ))
            .await
            .unwrap();

        scheduler.fire_schedule(stored).await;
        assert!(coordinator.list_tasks(&Default::default()).await.is_empty());
    }

    #[tokio::test]
    async fn test_remove_schedule_is_silent_for_unknown() {
        let (scheduler, _) = scheduler();
        scheduler.remove_schedule("ghost").await;
    }
}
