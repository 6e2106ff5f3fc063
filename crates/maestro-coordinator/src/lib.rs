//! The coordinator is the single authoritative arbiter of task state
//! transitions: it owns the agent, task and workflow registries, admits
//! submissions under backpressure, matches pending tasks against capable
//! agents, sweeps timeouts and publishes every transition on the event bus.

mod coordinator;
mod events;
mod queue;

pub use coordinator::{
    AgentUpdate, Coordinator, TaskCounts, TaskFilter, ERR_AGENT_LOST, ERR_TIMED_OUT,
    ERR_TRANSPORT_LOST,
};
pub use events::EventBus;
