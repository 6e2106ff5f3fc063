use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// Fallback timeout applied when a submission carries none.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Status of a task. `Completed`, `Failed`, `Cancelled` and `TimedOut` are
/// terminal; a task never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::TimedOut
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// A single unit of dispatchable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Empty until the matcher assigns an agent, unless the submitter pinned
    /// one up front.
    #[serde(default)]
    pub agent_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: i32,
    pub status: TaskStatus,
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub result: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(rename = "timeout_secs", with = "crate::serde_secs")]
    pub timeout: Duration,
    #[serde(default)]
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

impl Task {
    pub fn new(
        task_type: impl Into<String>,
        priority: i32,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: String::new(),
            task_type: task_type.into(),
            priority,
            status: TaskStatus::Pending,
            payload,
            result: HashMap::new(),
            error: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            timeout: DEFAULT_TASK_TIMEOUT,
            workflow_id: String::new(),
            step_index: None,
        }
    }

    /// Pin the task to one specific agent.
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_workflow(mut self, workflow_id: impl Into<String>, step_index: usize) -> Self {
        self.workflow_id = workflow_id.into();
        self.step_index = Some(step_index);
        self
    }
}
