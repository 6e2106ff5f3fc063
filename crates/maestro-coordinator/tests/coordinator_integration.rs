//! End-to-end coordinator scenarios: matching, capability misses, queue
//! fairness, timeouts and terminal-state discipline. Agents are simulated by
//! attaching inbox channels directly; frames go into a recording sink.

use async_trait::async_trait;
use maestro_coordinator::{Coordinator, TaskFilter};
use maestro_core::{
    Agent, AgentStatus, Frame, FrameSink, MaestroConfig, MaestroError, MaestroResult, Task,
    TaskStatus,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct RecordingSink {
    sent: Mutex<Vec<(String, Frame)>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn frames_for(&self, agent_id: &str) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == agent_id)
            .map(|(_, f)| f.clone())
            .collect()
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send_to_agent(&self, agent_id: &str, frame: Frame) -> MaestroResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((agent_id.to_string(), frame));
        Ok(())
    }
}

struct Harness {
    coordinator: Arc<Coordinator>,
    sink: Arc<RecordingSink>,
    _shutdown: watch::Sender<bool>,
}

fn harness() -> Harness {
    let sink = RecordingSink::new();
    let coordinator = Coordinator::new(MaestroConfig::default(), sink.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    coordinator.start(shutdown_rx);
    Harness {
        coordinator,
        sink,
        _shutdown: shutdown_tx,
    }
}

/// Register an agent and attach an inbox, returning the receiving end.
async fn connect_agent(
    coordinator: &Arc<Coordinator>,
    id: &str,
    capabilities: &[&str],
) -> mpsc::Receiver<Task> {
    let caps = capabilities.iter().map(|c| c.to_string()).collect();
    coordinator
        .register_agent(Agent::new(id, "generic", caps).with_id(id))
        .await
        .unwrap();
    let (tx, rx) = mpsc::channel(100);
    coordinator.attach_inbox(id, tx).await;
    rx
}

/// Poll until the task reaches the wanted status or the deadline expires.
async fn wait_task_status(coordinator: &Coordinator, task_id: &str, want: TaskStatus) {
    for _ in 0..200 {
        if coordinator.get_task(task_id).await.unwrap().status == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for task {task_id} to become {want}");
}

#[tokio::test]
async fn test_single_happy_path() {
    let h = harness();
    let mut inbox = connect_agent(&h.coordinator, "a1", &["code"]).await;

    let task = h
        .coordinator
        .submit_task(Task::new("code", 0, HashMap::new()).with_timeout(Duration::from_secs(10)))
        .await
        .unwrap();

    // Within the matching tick the task is Running and the agent Busy.
    wait_task_status(&h.coordinator, &task.id, TaskStatus::Running).await;
    let running = h.coordinator.get_task(&task.id).await.unwrap();
    assert_eq!(running.agent_id, "a1");
    assert!(running.started_at.is_some());
    assert_eq!(
        h.coordinator.get_agent("a1").await.unwrap().status,
        AgentStatus::Busy
    );

    // The inbox delivered the assigned task.
    let delivered = inbox.recv().await.unwrap();
    assert_eq!(delivered.id, task.id);

    // The agent reports success.
    let mut result = HashMap::new();
    result.insert("out".to_string(), json!("hello"));
    let done = h
        .coordinator
        .complete_task(&task.id, result, true, None)
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result["out"], "hello");
    assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
    assert_eq!(
        h.coordinator.get_agent("a1").await.unwrap().status,
        AgentStatus::Idle
    );
}

#[tokio::test]
async fn test_capability_miss_then_match() {
    let h = harness();
    let _a1 = connect_agent(&h.coordinator, "a1", &["code"]).await;

    let task = h
        .coordinator
        .submit_task(Task::new("data", 0, HashMap::new()))
        .await
        .unwrap();

    // Nobody speaks "data": the task parks, a1 stays idle.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        h.coordinator.get_task(&task.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert_eq!(
        h.coordinator.get_agent("a1").await.unwrap().status,
        AgentStatus::Idle
    );

    // A capable agent appears and the parked task is dispatched to it.
    let _a2 = connect_agent(&h.coordinator, "a2", &["data"]).await;
    wait_task_status(&h.coordinator, &task.id, TaskStatus::Running).await;
    assert_eq!(
        h.coordinator.get_task(&task.id).await.unwrap().agent_id,
        "a2"
    );
}

#[tokio::test]
async fn test_unmatched_head_does_not_starve_queue() {
    let h = harness();
    let _b_agent = connect_agent(&h.coordinator, "b-only", &["b"]).await;

    // Higher-priority task has no agent; the lower-priority one behind it
    // must still be dispatched.
    let blocked = h
        .coordinator
        .submit_task(Task::new("a", 9, HashMap::new()))
        .await
        .unwrap();
    let runnable = h
        .coordinator
        .submit_task(Task::new("b", 1, HashMap::new()))
        .await
        .unwrap();

    wait_task_status(&h.coordinator, &runnable.id, TaskStatus::Running).await;
    assert_eq!(
        h.coordinator.get_task(&blocked.id).await.unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_pinned_task_waits_for_its_agent() {
    let h = harness();
    let _a1 = connect_agent(&h.coordinator, "a1", &["x"]).await;

    // Pinned to an agent that does not exist yet: a1 must not steal it.
    let pinned = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()).with_agent("a2"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        h.coordinator.get_task(&pinned.id).await.unwrap().status,
        TaskStatus::Pending
    );

    let _a2 = connect_agent(&h.coordinator, "a2", &[]).await;
    wait_task_status(&h.coordinator, &pinned.id, TaskStatus::Running).await;
    assert_eq!(
        h.coordinator.get_task(&pinned.id).await.unwrap().agent_id,
        "a2"
    );
}

#[tokio::test]
async fn test_timeout_sweep_expires_task_and_frees_agent() {
    let h = harness();
    let mut inbox = connect_agent(&h.coordinator, "a1", &["x"]).await;

    let task = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()).with_timeout(Duration::from_millis(50)))
        .await
        .unwrap();
    wait_task_status(&h.coordinator, &task.id, TaskStatus::Running).await;
    let _ = inbox.recv().await.unwrap(); // the agent never replies

    tokio::time::sleep(Duration::from_millis(120)).await;
    h.coordinator.sweep_timeouts().await;

    let expired = h.coordinator.get_task(&task.id).await.unwrap();
    assert_eq!(expired.status, TaskStatus::TimedOut);
    assert!(!expired.error.is_empty());
    assert!(expired.completed_at.is_some());
    assert_eq!(
        h.coordinator.get_agent("a1").await.unwrap().status,
        AgentStatus::Idle
    );

    // The agent received a cancel frame so it stops working.
    let frames = h.sink.frames_for("a1");
    assert!(frames.iter().any(|f| f.frame_type == "task.cancel"));

    // The freed agent is immediately reusable.
    let next = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()))
        .await
        .unwrap();
    wait_task_status(&h.coordinator, &next.id, TaskStatus::Running).await;
}

#[tokio::test]
async fn test_duplicate_completion_is_rejected() {
    let h = harness();
    let mut inbox = connect_agent(&h.coordinator, "a1", &["x"]).await;

    let task = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()))
        .await
        .unwrap();
    wait_task_status(&h.coordinator, &task.id, TaskStatus::Running).await;
    let _ = inbox.recv().await.unwrap();

    h.coordinator
        .complete_task(&task.id, HashMap::new(), true, None)
        .await
        .unwrap();
    // First completion wins; the duplicate is an InvalidState the gateway
    // logs and drops.
    let err = h
        .coordinator
        .complete_task(&task.id, HashMap::new(), false, Some("late".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, MaestroError::InvalidState { .. }));
    assert_eq!(
        h.coordinator.get_task(&task.id).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_unregister_fails_running_tasks_with_agent_lost() {
    let h = harness();
    let mut inbox = connect_agent(&h.coordinator, "a1", &["x"]).await;

    let task = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()))
        .await
        .unwrap();
    wait_task_status(&h.coordinator, &task.id, TaskStatus::Running).await;
    let _ = inbox.recv().await.unwrap();

    h.coordinator.unregister_agent("a1").await;

    let failed = h.coordinator.get_task(&task.id).await.unwrap();
    assert_eq!(failed.status, TaskStatus::Failed);
    assert_eq!(failed.error, "agent_lost");
    assert!(h.coordinator.get_agent("a1").await.is_err());
}

#[tokio::test]
async fn test_terminal_states_are_final() {
    let h = harness();
    let task = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()))
        .await
        .unwrap();
    h.coordinator.cancel_task(&task.id).await.unwrap();

    let before = h.coordinator.get_task(&task.id).await.unwrap();
    assert!(h.coordinator.cancel_task(&task.id).await.is_err());
    assert!(h
        .coordinator
        .complete_task(&task.id, HashMap::new(), true, None)
        .await
        .is_err());
    let after = h.coordinator.get_task(&task.id).await.unwrap();
    assert_eq!(before.status, after.status);
    assert_eq!(before.completed_at, after.completed_at);
}

#[tokio::test]
async fn test_cancel_running_sends_cancel_frame() {
    let h = harness();
    let mut inbox = connect_agent(&h.coordinator, "a1", &["x"]).await;

    let task = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()))
        .await
        .unwrap();
    wait_task_status(&h.coordinator, &task.id, TaskStatus::Running).await;
    let _ = inbox.recv().await.unwrap();

    let cancelled = h.coordinator.cancel_task(&task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert_eq!(
        h.coordinator.get_agent("a1").await.unwrap().status,
        AgentStatus::Idle
    );
    let frames = h.sink.frames_for("a1");
    assert!(frames.iter().any(|f| f.frame_type == "task.cancel"));
}

#[tokio::test]
async fn test_list_tasks_filters() {
    let h = harness();
    let _a1 = connect_agent(&h.coordinator, "a1", &["x"]).await;

    let running = h
        .coordinator
        .submit_task(Task::new("x", 0, HashMap::new()))
        .await
        .unwrap();
    wait_task_status(&h.coordinator, &running.id, TaskStatus::Running).await;
    let _pending = h
        .coordinator
        .submit_task(Task::new("unmatched", 0, HashMap::new()))
        .await
        .unwrap();

    let by_status = h
        .coordinator
        .list_tasks(&TaskFilter {
            status: Some(TaskStatus::Running),
            ..TaskFilter::default()
        })
        .await;
    assert_eq!(by_status.len(), 1);
    assert_eq!(by_status[0].id, running.id);

    let by_agent = h
        .coordinator
        .list_tasks(&TaskFilter {
            agent_id: Some("a1".into()),
            ..TaskFilter::default()
        })
        .await;
    assert_eq!(by_agent.len(), 1);
}
