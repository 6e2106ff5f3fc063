use maestro_coordinator::Coordinator;
use maestro_core::{
    ErrorPolicy, Event, MaestroResult, Task, Workflow, WorkflowStatus, WorkflowStep,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Live bookkeeping for one executing workflow.
struct WorkflowRun {
    workflow: Workflow,
    policy: ErrorPolicy,
    /// task id → step id, for routing task events back to steps.
    step_of_task: HashMap<String, String>,
    submitted: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
}

impl WorkflowRun {
    fn new(workflow: Workflow) -> Self {
        let policy = workflow.config.error_policy;
        Self {
            workflow,
            policy,
            step_of_task: HashMap::new(),
            submitted: HashSet::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            skipped: HashSet::new(),
        }
    }

    /// Steps whose dependencies are all Completed and which have not been
    /// submitted or written off yet. Concurrent-eligible steps come back in
    /// one round regardless of their `parallel` flag — the dependency graph
    /// governs actual parallelism.
    fn eligible_steps(&self) -> Vec<WorkflowStep> {
        self.workflow
            .steps
            .iter()
            .filter(|step| {
                !self.submitted.contains(&step.id)
                    && !self.skipped.contains(&step.id)
                    && step.depends_on.iter().all(|d| self.completed.contains(d))
            })
            .cloned()
            .collect()
    }

    fn settled(&self) -> usize {
        self.completed.len() + self.failed.len() + self.skipped.len()
    }

    fn is_finished(&self) -> bool {
        self.settled() == self.workflow.steps.len()
    }

    fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Transitive dependents of `root` that have not completed: the steps to
    /// skip when `root` fails under `continue_on_error`.
    fn dependents_of(&self, root: &str) -> Vec<String> {
        let mut doomed: HashSet<&str> = HashSet::new();
        doomed.insert(root);
        // Steps are a DAG, so a fixed-point pass over the list terminates.
        let mut changed = true;
        while changed {
            changed = false;
            for step in &self.workflow.steps {
                if doomed.contains(step.id.as_str()) {
                    continue;
                }
                if step.depends_on.iter().any(|d| doomed.contains(d.as_str())) {
                    doomed.insert(step.id.as_str());
                    changed = true;
                }
            }
        }
        doomed.remove(root);
        doomed
            .into_iter()
            .filter(|id| !self.completed.contains(*id))
            .map(str::to_string)
            .collect()
    }
}

/// Expands workflows into task DAGs and advances them on task-outcome
/// events.
pub struct WorkflowEngine {
    coordinator: Arc<Coordinator>,
    runs: RwLock<HashMap<String, WorkflowRun>>,
}

impl WorkflowEngine {
    pub fn new(coordinator: Arc<Coordinator>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            runs: RwLock::new(HashMap::new()),
        })
    }

    /// Spawn the event loop advancing active runs.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!("Starting workflow engine");
        tokio::spawn(Arc::clone(self).run_events(shutdown))
    }

    /// Kick off a Draft workflow: Draft → Active, then submit every
    /// dependency-free step as a task.
    pub async fn execute(&self, workflow_id: &str) -> MaestroResult<Workflow> {
        let workflow = self.coordinator.begin_workflow(workflow_id).await?;
        info!(
            workflow_id,
            steps = workflow.steps.len(),
            "Workflow execution started"
        );

        let mut runs = self.runs.write().await;
        let mut run = WorkflowRun::new(workflow.clone());

        if run.workflow.steps.is_empty() {
            drop(runs);
            return self
                .coordinator
                .set_workflow_status(workflow_id, WorkflowStatus::Completed)
                .await;
        }

        let initial = run.eligible_steps();
        for step in initial {
            if let Err(e) = self.submit_step(&mut run, &step).await {
                warn!(workflow_id, step_id = %step.id, error = %e, "Initial step submission failed");
                drop(runs);
                self.coordinator
                    .set_workflow_status(workflow_id, WorkflowStatus::Failed)
                    .await?;
                return Err(e);
            }
        }
        runs.insert(workflow_id.to_string(), run);
        Ok(workflow)
    }

    /// Synthesize and submit the task for one step.
    async fn submit_step(&self, run: &mut WorkflowRun, step: &WorkflowStep) -> MaestroResult<()> {
        let step_index = run
            .workflow
            .steps
            .iter()
            .position(|s| s.id == step.id)
            .unwrap_or(0);
        let mut task = Task::new(step.step_type.clone(), 0, step.payload.clone())
            .with_timeout(step.timeout)
            .with_workflow(run.workflow.id.clone(), step_index);
        if !step.agent.is_empty() {
            task = task.with_agent(step.agent.clone());
        }

        let accepted = self.coordinator.submit_task(task).await?;
        debug!(
            workflow_id = %run.workflow.id,
            step_id = %step.id,
            task_id = %accepted.id,
            "Workflow step submitted"
        );
        run.step_of_task.insert(accepted.id, step.id.clone());
        run.submitted.insert(step.id.clone());
        Ok(())
    }

    async fn run_events(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut rx = self
            .coordinator
            .events()
            .subscribe("workflow-engine", 1024)
            .await;
        loop {
            tokio::select! {
                Some(event) = rx.recv() => self.handle_event(&event).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: &Event) {
        let success = match event.event_type.as_str() {
            "task.completed" => true,
            "task.failed" | "task.timeout" | "task.cancelled" => false,
            _ => return,
        };
        let workflow_id = event
            .data
            .get("workflow_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let task_id = event
            .data
            .get("task_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if workflow_id.is_empty() || task_id.is_empty() {
            return;
        }
        self.advance(workflow_id, task_id, success).await;
    }

    /// Apply one task outcome to its run and dispatch whatever became
    /// eligible.
    async fn advance(&self, workflow_id: &str, task_id: &str, success: bool) {
        let mut runs = self.runs.write().await;
        let Some(run) = runs.get_mut(workflow_id) else {
            return; // aborted or unknown run; late events are ignored
        };
        let Some(step_id) = run.step_of_task.get(task_id).cloned() else {
            return;
        };
        if run.completed.contains(&step_id)
            || run.failed.contains(&step_id)
            || run.skipped.contains(&step_id)
        {
            return;
        }

        if success {
            run.completed.insert(step_id.clone());
            debug!(workflow_id, step_id = %step_id, "Workflow step completed");

            for step in run.eligible_steps() {
                if let Err(e) = self.submit_step(run, &step).await {
                    warn!(workflow_id, step_id = %step.id, error = %e, "Step submission failed");
                    run.failed.insert(step.id.clone());
                }
            }
        } else {
            run.failed.insert(step_id.clone());
            match run.policy {
                ErrorPolicy::FailFast => {
                    // Abort: no new steps; still-running tasks finish or time
                    // out on their own.
                    warn!(workflow_id, step_id = %step_id, "Workflow step failed, aborting workflow");
                    runs.remove(workflow_id);
                    drop(runs);
                    let _ = self
                        .coordinator
                        .set_workflow_status(workflow_id, WorkflowStatus::Failed)
                        .await;
                    return;
                }
                ErrorPolicy::ContinueOnError => {
                    let doomed = run.dependents_of(&step_id);
                    for skip_id in doomed {
                        debug!(workflow_id, step_id = %skip_id, "Skipping dependent of failed step");
                        run.skipped.insert(skip_id.clone());
                        let step_index = run
                            .workflow
                            .steps
                            .iter()
                            .position(|s| s.id == skip_id)
                            .unwrap_or(0);
                        if let Some(step) =
                            run.workflow.steps.iter().find(|s| s.id == skip_id).cloned()
                        {
                            let record = Task::new(step.step_type, 0, step.payload)
                                .with_workflow(workflow_id.to_string(), step_index);
                            let record = self.coordinator.insert_cancelled_task(record).await;
                            run.step_of_task.insert(record.id, skip_id);
                        }
                    }
                    // Independent branches may have just become eligible
                    // relative to nothing; resubmission only happens on
                    // completions, so nothing to do here.
                }
            }
        }

        if run.is_finished() {
            let clean = run.is_clean();
            runs.remove(workflow_id);
            drop(runs);
            let status = if clean {
                WorkflowStatus::Completed
            } else {
                WorkflowStatus::Failed
            };
            info!(workflow_id, status = %status, "Workflow finished");
            let _ = self
                .coordinator
                .set_workflow_status(workflow_id, status)
                .await;
        }
    }

    pub async fn active_runs(&self) -> usize {
        self.runs.read().await.len()
    }
}
