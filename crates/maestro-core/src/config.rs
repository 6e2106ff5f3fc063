use serde::Deserialize;
use std::time::Duration;

/// Runtime configuration, loaded from a TOML file with every field
/// defaulted. `HTTP_PORT` and `GRPC_PORT` environment variables override the
/// ports, matching the deployment contract of earlier releases.
#[derive(Debug, Clone, Deserialize)]
pub struct MaestroConfig {
    /// Operational/REST + WebSocket listener.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Reserved for a structured-RPC binding; no listener is started.
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bound on submitted-but-not-yet-dispatched tasks.
    #[serde(default = "default_admission_queue_size")]
    pub admission_queue_size: usize,
    /// Per-agent inbox capacity.
    #[serde(default = "default_agent_inbox_size")]
    pub agent_inbox_size: usize,
    /// Per-connection outbound channel capacity.
    #[serde(default = "default_gateway_send_buffer")]
    pub gateway_send_buffer: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub timeout_sweep_interval_secs: u64,
    /// A connected agent silent longer than this is downgraded to Offline.
    #[serde(default = "default_inactive_threshold_secs")]
    pub agent_inactive_threshold_secs: u64,
    /// An agent silent longer than this is forced Offline and its running
    /// tasks are failed.
    #[serde(default = "default_dead_threshold_secs")]
    pub agent_dead_threshold_secs: u64,
}

fn default_http_port() -> u16 {
    8080
}
fn default_rpc_port() -> u16 {
    9090
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_admission_queue_size() -> usize {
    1000
}
fn default_agent_inbox_size() -> usize {
    100
}
fn default_gateway_send_buffer() -> usize {
    256
}
fn default_task_timeout_secs() -> u64 {
    30
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_inactive_threshold_secs() -> u64 {
    120
}
fn default_dead_threshold_secs() -> u64 {
    300
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            rpc_port: default_rpc_port(),
            log_level: default_log_level(),
            admission_queue_size: default_admission_queue_size(),
            agent_inbox_size: default_agent_inbox_size(),
            gateway_send_buffer: default_gateway_send_buffer(),
            task_timeout_secs: default_task_timeout_secs(),
            timeout_sweep_interval_secs: default_sweep_interval_secs(),
            agent_inactive_threshold_secs: default_inactive_threshold_secs(),
            agent_dead_threshold_secs: default_dead_threshold_secs(),
        }
    }
}

impl MaestroConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.timeout_sweep_interval_secs)
    }

    pub fn agent_inactive_threshold(&self) -> Duration {
        Duration::from_secs(self.agent_inactive_threshold_secs)
    }

    pub fn agent_dead_threshold(&self) -> Duration {
        Duration::from_secs(self.agent_dead_threshold_secs)
    }

    /// Apply `HTTP_PORT` / `GRPC_PORT` environment overrides.
    pub fn apply_env(&mut self) {
        if let Some(port) = env_port("HTTP_PORT") {
            self.http_port = port;
        }
        if let Some(port) = env_port("GRPC_PORT") {
            self.rpc_port = port;
        }
    }
}

fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = MaestroConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.rpc_port, 9090);
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.admission_queue_size, 1000);
        assert_eq!(cfg.agent_inbox_size, 100);
        assert_eq!(cfg.gateway_send_buffer, 256);
        assert_eq!(cfg.task_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(30));
        assert_eq!(cfg.agent_inactive_threshold(), Duration::from_secs(120));
        assert_eq!(cfg.agent_dead_threshold(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: MaestroConfig = toml::from_str("http_port = 9000\nlog_level = \"debug\"").unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.admission_queue_size, 1000);
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let cfg: MaestroConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.agent_inbox_size, 100);
        assert_eq!(cfg.timeout_sweep_interval_secs, 30);
    }
}
