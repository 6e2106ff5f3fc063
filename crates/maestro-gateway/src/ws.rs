use crate::clients::ClientRole;
use crate::requests::{AgentSpec, TaskSpec, WorkflowSpec};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use maestro_core::{AgentStatus, Frame, MaestroError};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Keepalive ping period; below the read deadline so healthy peers never
/// expire.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(54);
/// A connection silent for this long is torn down.
const READ_DEADLINE: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serve one connection with two cooperating loops: the writer drains the
/// client's send channel (plus keepalives), the reader parses inbound frames
/// under a read deadline. Neither can stall the other.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = Uuid::new_v4().to_string();
    let mut outbound = state.clients.register(&client_id).await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let welcome = Frame::new(
        "welcome",
        json!({ "client_id": client_id, "server": "maestro-orchestrator" }),
    );
    let _ = state.clients.send_to_client(&client_id, welcome).await;

    let mut send_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_state = Arc::clone(&state);
    let recv_client = client_id.clone();
    let mut recv_task = tokio::spawn(async move {
        loop {
            let message = match tokio::time::timeout(READ_DEADLINE, ws_receiver.next()).await {
                Err(_) => {
                    debug!(client_id = %recv_client, "Read deadline exceeded");
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(message))) => message,
            };
            recv_state.clients.touch(&recv_client).await;
            match message {
                Message::Text(text) => match serde_json::from_str::<Frame>(text.as_str()) {
                    Ok(frame) => handle_frame(&recv_state, &recv_client, frame).await,
                    Err(e) => {
                        warn!(client_id = %recv_client, error = %e, "Malformed frame dropped");
                    }
                },
                Message::Close(_) => break,
                // Pings are answered by the protocol layer; pongs only
                // matter as liveness, which the touch above recorded.
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Teardown: a dropped agent connection unregisters the agent, which
    // fails its running tasks with agent_lost.
    if let Some(agent_id) = state.clients.unregister(&client_id).await {
        info!(client_id, agent_id = %agent_id, "Agent connection closed");
        state.manager.detach(&agent_id).await;
        state.coordinator.unregister_agent(&agent_id).await;
    }
    info!(client_id, "WebSocket client disconnected");
}

async fn handle_frame(state: &Arc<AppState>, client_id: &str, frame: Frame) {
    debug!(client_id, frame_type = %frame.frame_type, "Received frame");
    match frame.frame_type.as_str() {
        "agent.register" => handle_agent_register(state, client_id, frame).await,
        "agent.unregister" => handle_agent_unregister(state, client_id).await,
        "agent.heartbeat" => handle_agent_heartbeat(state, client_id).await,
        "agent.task_result" => handle_task_result(state, client_id, frame).await,
        "user.command" => handle_user_command(state, client_id, frame).await,
        other => {
            warn!(client_id, frame_type = other, "Unknown frame type");
        }
    }
}

async fn handle_agent_register(state: &Arc<AppState>, client_id: &str, frame: Frame) {
    let Some(descriptor) = frame.data.get("agent") else {
        warn!(client_id, "agent.register without agent descriptor");
        return;
    };
    let spec: AgentSpec = match serde_json::from_value(descriptor.clone()) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(client_id, error = %e, "Invalid agent descriptor");
            return;
        }
    };

    let agent = match state.coordinator.register_agent(spec.into_agent()).await {
        Ok(agent) => agent,
        Err(e) => {
            warn!(client_id, error = %e, "Agent registration failed");
            return;
        }
    };
    state.manager.attach(&agent.id).await;
    state.clients.bind_agent(client_id, &agent.id).await;
    info!(client_id, agent_id = %agent.id, name = %agent.name, "Agent registered via WebSocket");

    let ack = Frame::new(
        "agent.registered",
        json!({ "agent_id": agent.id, "status": "registered" }),
    );
    let _ = state.clients.send_to_client(client_id, ack).await;
}

async fn handle_agent_unregister(state: &Arc<AppState>, client_id: &str) {
    let Some(agent_id) = state.clients.agent_of(client_id).await else {
        warn!(client_id, "Unregistration from non-agent client");
        return;
    };
    state.manager.detach(&agent_id).await;
    state.coordinator.unregister_agent(&agent_id).await;
    info!(client_id, agent_id = %agent_id, "Agent unregistered via WebSocket");
}

async fn handle_agent_heartbeat(state: &Arc<AppState>, client_id: &str) {
    let Some(agent_id) = state.clients.agent_of(client_id).await else {
        return;
    };
    state.manager.touch(&agent_id).await;
    state
        .coordinator
        .update_agent_status(&agent_id, AgentStatus::Active)
        .await;

    let ack = Frame::new(
        "agent.heartbeat_ack",
        json!({ "timestamp": Utc::now().timestamp() }),
    );
    let _ = state.clients.send_to_client(client_id, ack).await;
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    result: HashMap<String, serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

async fn handle_task_result(state: &Arc<AppState>, client_id: &str, frame: Frame) {
    let Some(agent_id) = state.clients.agent_of(client_id).await else {
        warn!(client_id, "Task result from non-agent client");
        return;
    };
    let Some(task_data) = frame.data.get("task") else {
        warn!(client_id, "agent.task_result without task object");
        return;
    };
    let outcome: TaskResult = match serde_json::from_value(task_data.clone()) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(client_id, error = %e, "Invalid task result");
            return;
        }
    };

    let success = matches!(outcome.status.as_str(), "" | "ok" | "success" | "completed");
    info!(
        agent_id = %agent_id,
        task_id = %outcome.id,
        status = %outcome.status,
        "Received task result from agent"
    );
    match state
        .coordinator
        .complete_task(&outcome.id, outcome.result, success, outcome.error)
        .await
    {
        Ok(_) => {}
        Err(MaestroError::InvalidState { id, status }) => {
            // First completion wins; a duplicate for a terminal task is noise.
            debug!(task_id = %id, status = %status, "Late task result ignored");
        }
        Err(e) => {
            warn!(task_id = %outcome.id, error = %e, "Task completion rejected");
        }
    }
}

async fn handle_user_command(state: &Arc<AppState>, client_id: &str, frame: Frame) {
    state.clients.set_role(client_id, ClientRole::User).await;
    let command = frame
        .data
        .get("command")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    match command {
        "list_agents" => {
            let agents = state.coordinator.list_agents().await;
            let reply = Frame::new("user.agents", json!({ "agents": agents }));
            let _ = state.clients.send_to_client(client_id, reply).await;
        }
        "create_task" => {
            let Some(task_data) = frame.data.get("task") else {
                send_error(state, client_id, "create_task without task object").await;
                return;
            };
            let spec: TaskSpec = match serde_json::from_value(task_data.clone()) {
                Ok(spec) => spec,
                Err(e) => {
                    send_error(state, client_id, &format!("invalid task: {e}")).await;
                    return;
                }
            };
            match state.coordinator.submit_task(spec.into_task()).await {
                Ok(task) => {
                    let reply = Frame::new(
                        "user.task_created",
                        json!({ "task_id": task.id, "status": "created" }),
                    );
                    let _ = state.clients.send_to_client(client_id, reply).await;
                }
                Err(e) => send_error(state, client_id, &e.to_string()).await,
            }
        }
        "create_workflow" => {
            let Some(wf_data) = frame.data.get("workflow") else {
                send_error(state, client_id, "create_workflow without workflow object").await;
                return;
            };
            let spec: WorkflowSpec = match serde_json::from_value(wf_data.clone()) {
                Ok(spec) => spec,
                Err(e) => {
                    send_error(state, client_id, &format!("invalid workflow: {e}")).await;
                    return;
                }
            };
            match state.coordinator.submit_workflow(spec.into_workflow()).await {
                Ok(workflow) => {
                    let reply = Frame::new(
                        "user.workflow_created",
                        json!({ "workflow_id": workflow.id, "status": "created" }),
                    );
                    let _ = state.clients.send_to_client(client_id, reply).await;
                }
                Err(e) => send_error(state, client_id, &e.to_string()).await,
            }
        }
        other => {
            warn!(client_id, command = other, "Unknown command");
        }
    }
}

async fn send_error(state: &Arc<AppState>, client_id: &str, message: &str) {
    let frame = Frame::new("error", json!({ "message": message }));
    let _ = state.clients.send_to_client(client_id, frame).await;
}
