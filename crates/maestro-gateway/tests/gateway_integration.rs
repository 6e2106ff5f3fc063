//! Full-stack gateway tests: a real server on a random port, agents speaking
//! the WebSocket frame protocol and callers on the REST surface.

use futures_util::{SinkExt, StreamExt};
use maestro_agents::AgentManager;
use maestro_coordinator::Coordinator;
use maestro_core::{FrameSink, MaestroConfig};
use maestro_gateway::{AppState, ClientRegistry, GatewayServer, Metrics};
use maestro_scheduler::Scheduler;
use maestro_workflow::WorkflowEngine;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    addr: String,
    state: Arc<AppState>,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

/// Build the full orchestrator stack on a random port, returning the address
/// and the shared state for direct assertions.
async fn start_test_server() -> TestServer {
    let config = MaestroConfig::default();
    let clients = ClientRegistry::new(config.gateway_send_buffer);
    let frames: Arc<dyn FrameSink> = clients.clone();

    let coordinator = Coordinator::new(config.clone(), Arc::clone(&frames));
    let manager = AgentManager::new(Arc::clone(&coordinator), frames, config.clone());
    let engine = WorkflowEngine::new(Arc::clone(&coordinator));
    let scheduler = Scheduler::new(Arc::clone(&coordinator), Arc::clone(&engine));
    let metrics = Metrics::new().unwrap();

    let state = Arc::new(AppState {
        coordinator: Arc::clone(&coordinator),
        manager: Arc::clone(&manager),
        engine: Arc::clone(&engine),
        scheduler: Arc::clone(&scheduler),
        clients,
        metrics,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    GatewayServer::start(&state, shutdown_rx.clone());
    coordinator.start(shutdown_rx.clone());
    manager.start(shutdown_rx.clone());
    engine.start(shutdown_rx.clone());
    scheduler.start(shutdown_rx);

    let app = GatewayServer::build(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        _shutdown: shutdown_tx,
    }
}

/// Connect and consume the welcome frame.
async fn connect_ws(addr: &str) -> (WsStream, String) {
    let url = format!("ws://{}/ws", addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let welcome = next_frame(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    let client_id = welcome["data"]["client_id"].as_str().unwrap().to_string();
    (ws, client_id)
}

/// Next text frame as JSON (skipping protocol-level frames).
async fn next_frame(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Wait for a frame of one specific type, skipping fan-out noise.
async fn next_frame_of_type(ws: &mut WsStream, frame_type: &str) -> Value {
    for _ in 0..20 {
        let frame = next_frame(ws).await;
        if frame["type"] == frame_type {
            return frame;
        }
    }
    panic!("never received frame of type {frame_type}");
}

async fn register_agent(ws: &mut WsStream, id: &str, capabilities: &[&str]) {
    let frame = json!({
        "type": "agent.register",
        "timestamp": chrono_now(),
        "data": {
            "agent": {
                "id": id,
                "name": id,
                "type": "generic",
                "capabilities": capabilities,
            }
        }
    });
    ws.send(Message::text(frame.to_string())).await.unwrap();
    let ack = next_frame_of_type(ws, "agent.registered").await;
    assert_eq!(ack["data"]["agent_id"], id);
}

fn chrono_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let resp = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_agent_round_trip_over_websocket() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let state = Arc::clone(&server.state);
    let (mut ws, _) = connect_ws(&addr).await;
    register_agent(&mut ws, "agent-1", &["code"]).await;

    // Submit a task over REST; it should be dispatched to the agent.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{}/api/v1/tasks", addr))
        .json(&json!({"type": "code", "timeout_secs": 10}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let task: Value = resp.json().await.unwrap();
    let task_id = task["id"].as_str().unwrap().to_string();

    let dispatch = next_frame_of_type(&mut ws, "task.dispatch").await;
    assert_eq!(dispatch["data"]["task"]["id"], task_id.as_str());

    // Report the result and observe completion on the REST surface.
    let result = json!({
        "type": "agent.task_result",
        "timestamp": chrono_now(),
        "data": {
            "task": {
                "id": task_id,
                "status": "completed",
                "result": {"out": "hello"}
            }
        }
    });
    ws.send(Message::text(result.to_string())).await.unwrap();

    for _ in 0..100 {
        let task: Value = client
            .get(format!("http://{}/api/v1/tasks/{}", addr, task_id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if task["status"] == "completed" {
            assert_eq!(task["result"]["out"], "hello");
            let agent = state.coordinator.get_agent("agent-1").await.unwrap();
            assert_eq!(agent.status, maestro_core::AgentStatus::Idle);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task never completed");
}

#[tokio::test]
async fn test_heartbeat_is_acked() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let (mut ws, _) = connect_ws(&addr).await;
    register_agent(&mut ws, "agent-hb", &[]).await;

    let heartbeat = json!({
        "type": "agent.heartbeat",
        "timestamp": chrono_now(),
        "data": {}
    });
    ws.send(Message::text(heartbeat.to_string())).await.unwrap();
    let ack = next_frame_of_type(&mut ws, "agent.heartbeat_ack").await;
    assert!(ack["data"]["timestamp"].is_number());
}

#[tokio::test]
async fn test_disconnect_fails_running_task() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let state = Arc::clone(&server.state);
    let (mut ws, _) = connect_ws(&addr).await;
    register_agent(&mut ws, "agent-gone", &["code"]).await;

    let task = state
        .coordinator
        .submit_task(maestro_core::Task::new("code", 0, Default::default()))
        .await
        .unwrap();
    let _dispatch = next_frame_of_type(&mut ws, "task.dispatch").await;

    // Drop the connection mid-task.
    drop(ws);

    for _ in 0..100 {
        let current = state.coordinator.get_task(&task.id).await.unwrap();
        if current.status == maestro_core::TaskStatus::Failed {
            assert_eq!(current.error, "agent_lost");
            // The agent was unregistered on clean close.
            assert!(state.coordinator.get_agent("agent-gone").await.is_err());
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task never failed after disconnect");
}

#[tokio::test]
async fn test_user_command_list_agents() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let (mut agent_ws, _) = connect_ws(&addr).await;
    register_agent(&mut agent_ws, "agent-listed", &["code"]).await;

    let (mut user_ws, _) = connect_ws(&addr).await;
    let command = json!({
        "type": "user.command",
        "timestamp": chrono_now(),
        "data": {"command": "list_agents"}
    });
    user_ws.send(Message::text(command.to_string())).await.unwrap();

    let reply = next_frame_of_type(&mut user_ws, "user.agents").await;
    let agents = reply["data"]["agents"].as_array().unwrap();
    assert!(agents.iter().any(|a| a["id"] == "agent-listed"));
}

#[tokio::test]
async fn test_user_command_create_task() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let (mut user_ws, _) = connect_ws(&addr).await;

    let command = json!({
        "type": "user.command",
        "timestamp": chrono_now(),
        "data": {
            "command": "create_task",
            "task": {"type": "code", "priority": 1}
        }
    });
    user_ws.send(Message::text(command.to_string())).await.unwrap();
    let reply = next_frame_of_type(&mut user_ws, "user.task_created").await;
    assert_eq!(reply["data"]["status"], "created");
    assert!(reply["data"]["task_id"].is_string());
}

#[tokio::test]
async fn test_unknown_frame_type_does_not_disconnect() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let (mut ws, _) = connect_ws(&addr).await;

    let junk = json!({
        "type": "something.unknown",
        "timestamp": chrono_now(),
        "data": {}
    });
    ws.send(Message::text(junk.to_string())).await.unwrap();

    // The connection is still serviceable afterwards.
    let command = json!({
        "type": "user.command",
        "timestamp": chrono_now(),
        "data": {"command": "list_agents"}
    });
    ws.send(Message::text(command.to_string())).await.unwrap();
    let reply = next_frame_of_type(&mut ws, "user.agents").await;
    assert!(reply["data"]["agents"].is_array());
}

#[tokio::test]
async fn test_rest_workflow_lifecycle() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{}/api/v1/workflows", addr))
        .json(&json!({
            "name": "pipeline",
            "steps": [
                {"id": "s1", "type": "a"},
                {"id": "s2", "type": "b", "depends_on": ["s1"]}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let workflow: Value = resp.json().await.unwrap();
    assert_eq!(workflow["status"], "draft");
    let id = workflow["id"].as_str().unwrap();

    let resp = client
        .post(format!("http://{}/api/v1/workflows/{}/execute", addr, id))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "active");

    // A cyclic workflow is rejected outright.
    let resp = client
        .post(format!("http://{}/api/v1/workflows", addr))
        .json(&json!({
            "name": "loop",
            "steps": [
                {"id": "s1", "type": "a", "depends_on": ["s2"]},
                {"id": "s2", "type": "b", "depends_on": ["s1"]}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_rest_backpressure_returns_429() {
    // A dedicated stack with a tiny admission queue.
    let config = MaestroConfig {
        admission_queue_size: 2,
        ..MaestroConfig::default()
    };
    let clients = ClientRegistry::new(config.gateway_send_buffer);
    let frames: Arc<dyn FrameSink> = clients.clone();
    let coordinator = Coordinator::new(config.clone(), Arc::clone(&frames));
    let manager = AgentManager::new(Arc::clone(&coordinator), frames, config.clone());
    let engine = WorkflowEngine::new(Arc::clone(&coordinator));
    let scheduler = Scheduler::new(Arc::clone(&coordinator), Arc::clone(&engine));
    let state = Arc::new(AppState {
        coordinator,
        manager,
        engine,
        scheduler,
        clients,
        metrics: Metrics::new().unwrap(),
    });
    let app = GatewayServer::build(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // No matching loop is running, so submissions stay Pending.
    let client = reqwest::Client::new();
    for _ in 0..2 {
        let resp = client
            .post(format!("http://{}/api/v1/tasks", addr))
            .json(&json!({"type": "code"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
    }
    let resp = client
        .post(format!("http://{}/api/v1/tasks", addr))
        .json(&json!({"type": "code"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);
}

#[tokio::test]
async fn test_metrics_endpoint_reports_counters() {
    let server = start_test_server().await;
    let addr = server.addr.clone();
    let client = reqwest::Client::new();
    client
        .post(format!("http://{}/api/v1/tasks", addr))
        .json(&json!({"type": "code"}))
        .send()
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let text = client
        .get(format!("http://{}/metrics", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("maestro_tasks_submitted_total 1"));
    assert!(text.contains("maestro_tasks_pending 1"));
}
