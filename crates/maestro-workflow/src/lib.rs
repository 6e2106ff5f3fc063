//! The workflow engine expands a declarative workflow into a dependency DAG
//! of tasks, submits the eligible steps through the coordinator's normal
//! admission path and advances the DAG as task outcomes arrive on the event
//! bus.

mod engine;

pub use engine::WorkflowEngine;
