use maestro_agents::ConnectionStats;
use maestro_coordinator::TaskCounts;
use maestro_core::{Event, MaestroError, MaestroResult};
use prometheus::{IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus counters and gauges for the orchestrator. Counters are fed by
/// an event-bus consumer; gauges are refreshed from live snapshots at scrape
/// time.
pub struct Metrics {
    registry: Registry,
    tasks_submitted: IntCounter,
    tasks_completed: IntCounter,
    tasks_failed: IntCounter,
    tasks_timed_out: IntCounter,
    tasks_cancelled: IntCounter,
    agents_registered: IntCounter,
    agents_unregistered: IntCounter,
    workflows_started: IntCounter,
    workflows_completed: IntCounter,
    workflows_failed: IntCounter,
    tasks_pending: IntGauge,
    tasks_running: IntGauge,
    inbox_depth: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> MaestroResult<IntCounter> {
    let c = IntCounter::new(name, help).map_err(metrics_err)?;
    registry.register(Box::new(c.clone())).map_err(metrics_err)?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> MaestroResult<IntGauge> {
    let g = IntGauge::new(name, help).map_err(metrics_err)?;
    registry.register(Box::new(g.clone())).map_err(metrics_err)?;
    Ok(g)
}

fn metrics_err(e: prometheus::Error) -> MaestroError {
    MaestroError::Config(format!("metrics registration failed: {e}"))
}

impl Metrics {
    pub fn new() -> MaestroResult<Arc<Self>> {
        let registry = Registry::new();
        let inbox_depth = IntGaugeVec::new(
            Opts::new("maestro_agent_inbox_depth", "Tasks queued per agent inbox"),
            &["agent_id"],
        )
        .map_err(metrics_err)?;
        registry
            .register(Box::new(inbox_depth.clone()))
            .map_err(metrics_err)?;

        Ok(Arc::new(Self {
            tasks_submitted: counter(
                &registry,
                "maestro_tasks_submitted_total",
                "Tasks accepted by the coordinator",
            )?,
            tasks_completed: counter(
                &registry,
                "maestro_tasks_completed_total",
                "Tasks that reached Completed",
            )?,
            tasks_failed: counter(
                &registry,
                "maestro_tasks_failed_total",
                "Tasks that reached Failed",
            )?,
            tasks_timed_out: counter(
                &registry,
                "maestro_tasks_timed_out_total",
                "Tasks expired by the timeout sweeper",
            )?,
            tasks_cancelled: counter(
                &registry,
                "maestro_tasks_cancelled_total",
                "Tasks cancelled by callers or skipped by workflows",
            )?,
            agents_registered: counter(
                &registry,
                "maestro_agents_registered_total",
                "Agent registrations",
            )?,
            agents_unregistered: counter(
                &registry,
                "maestro_agents_unregistered_total",
                "Agent unregistrations",
            )?,
            workflows_started: counter(
                &registry,
                "maestro_workflows_started_total",
                "Workflows moved to Active",
            )?,
            workflows_completed: counter(
                &registry,
                "maestro_workflows_completed_total",
                "Workflows that reached Completed",
            )?,
            workflows_failed: counter(
                &registry,
                "maestro_workflows_failed_total",
                "Workflows that reached Failed",
            )?,
            tasks_pending: gauge(&registry, "maestro_tasks_pending", "Tasks awaiting matching")?,
            tasks_running: gauge(&registry, "maestro_tasks_running", "Tasks currently running")?,
            inbox_depth,
            registry,
        }))
    }

    pub fn observe_event(&self, event: &Event) {
        match event.event_type.as_str() {
            "task.submitted" => self.tasks_submitted.inc(),
            "task.completed" => self.tasks_completed.inc(),
            "task.failed" => self.tasks_failed.inc(),
            "task.timeout" => self.tasks_timed_out.inc(),
            "task.cancelled" => self.tasks_cancelled.inc(),
            "agent.registered" => self.agents_registered.inc(),
            "agent.unregistered" => self.agents_unregistered.inc(),
            "workflow.started" => self.workflows_started.inc(),
            "workflow.completed" => self.workflows_completed.inc(),
            "workflow.failed" => self.workflows_failed.inc(),
            _ => {}
        }
    }

    /// Refresh the gauges and render the registry in Prometheus text format.
    pub fn render(&self, counts: TaskCounts, connections: &[ConnectionStats]) -> MaestroResult<String> {
        self.tasks_pending.set(counts.pending as i64);
        self.tasks_running.set(counts.running as i64);
        self.inbox_depth.reset();
        for conn in connections {
            self.inbox_depth
                .with_label_values(&[conn.agent_id.as_str()])
                .set(conn.inbox_depth as i64);
        }

        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .map_err(|e| MaestroError::Config(format!("metrics encoding failed: {e}")))
    }
}
