use clap::{Parser, Subcommand};
use maestro_agents::AgentManager;
use maestro_coordinator::Coordinator;
use maestro_core::{FrameSink, MaestroConfig};
use maestro_gateway::{AppState, ClientRegistry, GatewayServer, Metrics};
use maestro_scheduler::Scheduler;
use maestro_workflow::WorkflowEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maestro", about = "Maestro — multi-agent task orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "maestro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    config.apply_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .json()
        .init();

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(port) = port {
                config.http_port = port;
            }
            serve(config, host).await
        }
    }
}

/// Load the TOML config file. A missing file means all defaults; a present
/// but broken one is an error worth stopping for.
fn load_config(path: &Path) -> anyhow::Result<MaestroConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(_) => return Ok(MaestroConfig::default()),
    };
    toml::from_str(&contents).map_err(|e| {
        anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
    })
}

/// Wire the orchestrator: one long-lived object graph built here, no global
/// mutable state. The gateway's client registry doubles as the frame sink
/// for the coordinator and the agent manager.
async fn serve(config: MaestroConfig, host: String) -> anyhow::Result<()> {
    let clients = ClientRegistry::new(config.gateway_send_buffer);
    let frames: Arc<dyn FrameSink> = clients.clone();

    let coordinator = Coordinator::new(config.clone(), Arc::clone(&frames));
    let manager = AgentManager::new(Arc::clone(&coordinator), frames, config.clone());
    let engine = WorkflowEngine::new(Arc::clone(&coordinator));
    let scheduler = Scheduler::new(Arc::clone(&coordinator), Arc::clone(&engine));
    let metrics = Metrics::new().map_err(|e| anyhow::anyhow!("metrics setup failed: {e}"))?;

    let state = Arc::new(AppState {
        coordinator: Arc::clone(&coordinator),
        manager: Arc::clone(&manager),
        engine: Arc::clone(&engine),
        scheduler: Arc::clone(&scheduler),
        clients,
        metrics,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    handles.extend(GatewayServer::start(&state, shutdown_rx.clone()));
    handles.extend(coordinator.start(shutdown_rx.clone()));
    handles.extend(manager.start(shutdown_rx.clone()));
    handles.push(engine.start(shutdown_rx.clone()));
    handles.push(scheduler.start(shutdown_rx.clone()));

    let app = GatewayServer::build(state);
    let addr = format!("{}:{}", host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Maestro orchestrator listening on {}", addr);
    debug!(
        port = config.rpc_port,
        "Structured RPC port reserved, no services bound"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("Shutting down gracefully");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }
    info!("Shutdown complete");
    Ok(())
}
