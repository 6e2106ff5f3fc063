pub mod agent;
pub mod config;
pub mod frame;
pub mod schedule;
pub mod task;
pub mod workflow;

pub use agent::{Agent, AgentStatus};
pub use config::MaestroConfig;
pub use frame::{Event, Frame, FrameSink};
pub use schedule::{Schedule, ScheduleTarget};
pub use task::{Task, TaskStatus};
pub use workflow::{ErrorPolicy, Workflow, WorkflowConfig, WorkflowStatus, WorkflowStep};

// --- Error types ---

#[derive(Debug, thiserror::Error)]
pub enum MaestroError {
    /// The referenced entity does not exist.
    #[error("Not found: {kind} {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operation is illegal for the entity's current status.
    #[error("Invalid state: {id} is {status}")]
    InvalidState { id: String, status: String },

    /// Structural error in input (cyclic workflow, malformed cron, ...).
    #[error("Invalid: {0}")]
    Invalid(String),

    /// A bounded queue refused the item; the caller must retry with backoff.
    #[error("Queue full: {0}")]
    QueueFull(&'static str),

    /// Delivery over the real-time channel failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MaestroError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_state(id: impl Into<String>, status: impl ToString) -> Self {
        Self::InvalidState {
            id: id.into(),
            status: status.to_string(),
        }
    }
}

pub type MaestroResult<T> = Result<T, MaestroError>;

/// Serialize a `std::time::Duration` as whole seconds on the wire.
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message() {
        let err = MaestroError::not_found("task", "t-1");
        assert_eq!(err.to_string(), "Not found: task t-1");
    }

    #[test]
    fn test_invalid_state_carries_status() {
        let err = MaestroError::invalid_state("t-1", TaskStatus::Completed);
        assert!(err.to_string().contains("completed"));
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: Result<Task, _> = serde_json::from_str("not json");
        let err: MaestroError = parse.unwrap_err().into();
        assert!(matches!(err, MaestroError::Json(_)));
    }
}
