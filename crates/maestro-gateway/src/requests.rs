use maestro_core::{Agent, Schedule, ScheduleTarget, Task, Workflow, WorkflowConfig, WorkflowStep};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Agent descriptor accepted over REST and in `agent.register` frames.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSpec {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub agent_type: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentSpec {
    pub fn into_agent(self) -> Agent {
        let mut agent = Agent::new(self.name, self.agent_type, self.capabilities);
        if !self.id.is_empty() {
            agent = agent.with_id(self.id);
        }
        agent.config = self.config;
        agent.metadata = self.metadata;
        agent
    }
}

/// Task submission accepted over REST and in `user.command` frames.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub timeout_secs: u64,
}

impl TaskSpec {
    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.task_type, self.priority, self.payload);
        if !self.agent_id.is_empty() {
            task = task.with_agent(self.agent_id);
        }
        if self.timeout_secs > 0 {
            task = task.with_timeout(Duration::from_secs(self.timeout_secs));
        }
        task
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl StepSpec {
    fn into_step(self) -> WorkflowStep {
        let mut step = WorkflowStep::new(self.step_type)
            .with_payload(self.payload)
            .depends_on(self.depends_on);
        if !self.id.is_empty() {
            step = step.with_id(self.id);
        }
        if !self.agent.is_empty() {
            step = step.with_agent(self.agent);
        }
        if self.timeout_secs > 0 {
            step = step.with_timeout(Duration::from_secs(self.timeout_secs));
        }
        step.parallel = self.parallel;
        step
    }
}

/// Workflow submission accepted over REST and in `user.command` frames.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: WorkflowConfig,
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

impl WorkflowSpec {
    pub fn into_workflow(self) -> Workflow {
        let mut workflow = Workflow::new(self.name, self.description);
        workflow.config = self.config;
        for step in self.steps {
            workflow.add_step(step.into_step());
        }
        workflow
    }
}

/// Schedule registration accepted over REST.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSpec {
    pub name: String,
    #[serde(rename = "target_type")]
    pub target: ScheduleTarget,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl ScheduleSpec {
    pub fn into_schedule(self) -> Schedule {
        let mut schedule = Schedule::new(self.name, self.target, self.cron, self.payload);
        schedule.enabled = self.enabled;
        schedule
    }
}
