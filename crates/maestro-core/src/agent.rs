use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Status of an agent in the orchestrator's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Active,
    Busy,
    Offline,
    Error,
    Terminated,
}

impl AgentStatus {
    /// Whether the matcher may hand this agent a new task. `Active` is an
    /// agent that recently heartbeated while not running anything, so it is
    /// as eligible as `Idle`.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, AgentStatus::Idle | AgentStatus::Active)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
            AgentStatus::Error => write!(f, "error"),
            AgentStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// A long-lived worker connected over the real-time channel, advertising a
/// set of capability tags and accepting dispatched tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
    pub last_seen: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        agent_type: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            agent_type: agent_type.into(),
            status: AgentStatus::Idle,
            capabilities,
            config: HashMap::new(),
            last_seen: now,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Keep a caller-supplied identifier instead of the generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}
