use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// What a schedule synthesizes when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleTarget {
    Task,
    Workflow,
}

/// A cron-driven rule that periodically synthesizes a task or workflow
/// submission. Disabled schedules are retained but never fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub name: String,
    #[serde(rename = "target_type")]
    pub target: ScheduleTarget,
    /// Seconds-resolution cron expression, validated at registration.
    pub cron: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,
    /// Target description: a `task` or `workflow` object, depending on
    /// `target_type`.
    #[serde(default)]
    pub payload: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        target: ScheduleTarget,
        cron: impl Into<String>,
        payload: HashMap<String, serde_json::Value>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            target,
            cron: cron.into(),
            enabled: true,
            last_run: None,
            next_run: None,
            payload,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_schedule_enabled_by_default() {
        let sched = Schedule::new("nightly", ScheduleTarget::Task, "0 0 3 * * *", HashMap::new());
        assert!(sched.enabled);
        assert!(sched.last_run.is_none());
        assert!(sched.next_run.is_none());
    }

    #[test]
    fn test_target_wire_values() {
        assert_eq!(
            serde_json::to_string(&ScheduleTarget::Workflow).unwrap(),
            "\"workflow\""
        );
        let parsed: ScheduleTarget = serde_json::from_str("\"task\"").unwrap();
        assert_eq!(parsed, ScheduleTarget::Task);
    }

    #[test]
    fn test_enabled_defaults_on_deserialize() {
        let json = r#"{
            "id": "s-1",
            "name": "hourly",
            "target_type": "task",
            "cron": "0 0 * * * *",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }"#;
        let sched: Schedule = serde_json::from_str(json).unwrap();
        assert!(sched.enabled);
    }
}
