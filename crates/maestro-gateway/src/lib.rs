//! The gateway multiplexes a message-oriented full-duplex transport between
//! external peers (agents, dashboards, monitors) and the orchestrator core,
//! and exposes the operational REST surface, the health probe and the
//! metrics endpoint.

pub mod api;
mod clients;
mod metrics;
mod requests;
mod server;
mod ws;

pub use clients::{ClientRegistry, ClientRole};
pub use metrics::Metrics;
pub use requests::{AgentSpec, ScheduleSpec, StepSpec, TaskSpec, WorkflowSpec};
pub use server::{AppState, GatewayServer};
