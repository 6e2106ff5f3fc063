use crate::{MaestroError, MaestroResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Draft => write!(f, "draft"),
            WorkflowStatus::Active => write!(f, "active"),
            WorkflowStatus::Paused => write!(f, "paused"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How the engine reacts when a step ends in anything but `Completed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort the workflow; no new steps are dispatched.
    #[default]
    FailFast,
    /// Skip the failed step's dependents; independent branches proceed.
    ContinueOnError,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

/// One step of a workflow. Immutable once the workflow is Active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: String,
    /// Optional pinned agent id; empty means "any capable agent".
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(
        rename = "timeout_secs",
        with = "crate::serde_secs",
        default = "default_step_timeout"
    )]
    pub timeout: Duration,
    /// Step ids that must complete before this step becomes eligible.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_step_timeout() -> Duration {
    crate::task::DEFAULT_TASK_TIMEOUT
}

impl WorkflowStep {
    pub fn new(step_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            step_type: step_type.into(),
            agent: String::new(),
            payload: HashMap::new(),
            parallel: false,
            timeout: default_step_timeout(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_payload(mut self, payload: HashMap<String, serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// A declarative, DAG-shaped collection of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

impl Workflow {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
            config: WorkflowConfig::default(),
        }
    }

    pub fn add_step(&mut self, step: WorkflowStep) -> &mut Self {
        self.steps.push(step);
        self.updated_at = Utc::now();
        self
    }

    pub fn step(mut self, step: WorkflowStep) -> Self {
        self.add_step(step);
        self
    }

    /// Structural validation: every `depends_on` entry must name a step of
    /// this workflow, and the dependency graph must be acyclic.
    pub fn validate(&self) -> MaestroResult<()> {
        let ids: HashMap<&str, &WorkflowStep> =
            self.steps.iter().map(|s| (s.id.as_str(), s)).collect();

        if ids.len() != self.steps.len() {
            return Err(MaestroError::Invalid(format!(
                "workflow {} has duplicate step ids",
                self.id
            )));
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !ids.contains_key(dep.as_str()) {
                    return Err(MaestroError::Invalid(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )));
                }
            }
        }

        // Tri-color DFS: 1 = in progress, 2 = done. A back edge is a cycle.
        let mut visited: HashMap<&str, u8> = HashMap::new();
        for step in &self.steps {
            if Self::dfs_cycle(step.id.as_str(), &ids, &mut visited) {
                return Err(MaestroError::Invalid(format!(
                    "workflow {} has a dependency cycle",
                    self.id
                )));
            }
        }

        Ok(())
    }

    fn dfs_cycle<'a>(
        id: &'a str,
        steps: &HashMap<&'a str, &'a WorkflowStep>,
        visited: &mut HashMap<&'a str, u8>,
    ) -> bool {
        match visited.get(id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(step) = steps.get(id) {
            for dep in &step.depends_on {
                if Self::dfs_cycle(dep.as_str(), steps, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}
