use crate::api;
use crate::clients::ClientRegistry;
use crate::metrics::Metrics;
use crate::ws;
use axum::{routing::get, Router};
use maestro_agents::AgentManager;
use maestro_coordinator::Coordinator;
use maestro_scheduler::Scheduler;
use maestro_workflow::WorkflowEngine;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Shared application state behind every handler.
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub manager: Arc<AgentManager>,
    pub engine: Arc<WorkflowEngine>,
    pub scheduler: Arc<Scheduler>,
    pub clients: Arc<ClientRegistry>,
    pub metrics: Arc<Metrics>,
}

/// Event types worth pushing to connected observers (dashboards, monitors).
const FANOUT_EVENTS: &[&str] = &[
    "task.assigned",
    "task.completed",
    "task.failed",
    "task.timeout",
    "task.cancelled",
    "agent.registered",
    "agent.unregistered",
    "workflow.started",
    "workflow.completed",
    "workflow.failed",
];

pub struct GatewayServer;

impl GatewayServer {
    pub fn build(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/ws", get(ws::ws_handler))
            .route("/health", get(api::health))
            .route("/metrics", get(api::metrics))
            .nest("/api/v1", api::api_router())
            .with_state(state)
    }

    /// Spawn the event consumers: the observer fan-out and the metrics
    /// collector.
    pub fn start(state: &Arc<AppState>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("Starting gateway event consumers");
        vec![
            tokio::spawn(run_fanout(Arc::clone(state), shutdown.clone())),
            tokio::spawn(run_metrics(Arc::clone(state), shutdown)),
        ]
    }
}

async fn run_fanout(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut rx = state.coordinator.events().subscribe("gateway", 256).await;
    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if FANOUT_EVENTS.contains(&event.event_type.as_str()) {
                    state.clients.broadcast_observers(&event.into_frame()).await;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_metrics(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) {
    let mut rx = state.coordinator.events().subscribe("metrics", 1024).await;
    loop {
        tokio::select! {
            Some(event) = rx.recv() => state.metrics.observe_event(&event),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
