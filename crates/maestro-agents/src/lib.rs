//! The agent manager tracks the currently-connected agents, owns their
//! bounded inboxes, drives one dispatch loop per agent and enforces the two
//! liveness thresholds. Completion of dispatched work is event-driven: once
//! a task is handed to the gateway, the manager only observes the outcome
//! through the coordinator's event bus.

mod manager;

pub use manager::{AgentManager, ConnectionStats};
