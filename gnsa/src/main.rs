//! GPU Node Selection Agent (GNSA)
//!
//! Runs as a DaemonSet on GPU nodes. Each tick samples free/total memory of
//! the visible GPUs, scores the node, publishes the score as node labels and
//! cordons or deletes the node's own object when it stays unhealthy.

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use gnsa_core::cluster::{ClusterApi, InMemoryCluster, NodeIdentity, NodeScope};
use gnsa_core::device::create_device_interface;
use gnsa_core::metrics::MetricsRegistry;
use gnsa_core::{Agent, NodeActionExecutor, PolicyEvaluator, PolicyMode, VisibleDeviceMask};
use gnsa_k8s::K8sClient;

/// Initialize the tracing/logging subsystem
fn init_logging(log_level: &str, json_format: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

/// Apply CLI flags (and their environment variables) over the file config
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if cli.dry_run {
        config.dry_run = true;
    }
    if let Some(name) = &cli.node_name {
        config.node_name = Some(name.clone());
    }
    if let Some(mode) = &cli.mode {
        config.mode = Some(mode.clone());
    }
    if let Some(mask) = &cli.visible_devices {
        config.visible_devices = Some(mask.clone());
    }
}

/// Wire the agent for a node
fn build_agent(
    config: &Config,
    node: NodeIdentity,
    mode: PolicyMode,
    mask: VisibleDeviceMask,
    cluster: Arc<dyn ClusterApi>,
    metrics: Arc<MetricsRegistry>,
) -> Agent {
    let device = create_device_interface(config.device_type, &config.mock_memory());

    let scope = NodeScope::new(cluster, node.clone(), config.executor.api_timeout);
    let executor = NodeActionExecutor::new(scope, config.executor_config(), mode);
    let evaluator = PolicyEvaluator::new(mode, config.thresholds());

    info!(
        node = %node,
        device_type = %config.device_type,
        allow_delete = config.executor.allow_delete,
        publish_score = config.executor.publish_score,
        "Agent configured"
    );

    Agent::new(
        node,
        mask,
        device,
        evaluator,
        executor,
        metrics,
        config.interval,
    )
}

/// Run the main agent loop
async fn run(
    config: Config,
    node: NodeIdentity,
    mode: PolicyMode,
    mask: VisibleDeviceMask,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let metrics = Arc::new(MetricsRegistry::new());

    let k8s_client = K8sClient::new().await?;
    if let Err(e) = k8s_client.health_check().await {
        warn!(error = %e, "Kubernetes API health check failed, node actions will be retried");
    }

    let mut agent = build_agent(&config, node, mode, mask, Arc::new(k8s_client), metrics);

    // Start metrics server if enabled
    if config.metrics.enabled {
        let port = config.metrics.port;
        let path = config.metrics.path.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port, path).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    agent.run(shutdown_rx).await;

    info!("GNSA shutdown complete");
    Ok(())
}

/// Start the Prometheus metrics HTTP server
async fn start_metrics_server(port: u16, path: String) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, path = %path, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;
        let path = path.clone();

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let n = socket.read(&mut buf).await.unwrap_or(0);
            let request = String::from_utf8_lossy(&buf[..n]);
            let target = request.split_whitespace().nth(1).unwrap_or("/");

            let response = if target == path {
                let metrics_output = prometheus::TextEncoder::new()
                    .encode_to_string(&prometheus::gather())
                    .unwrap_or_default();
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics_output.len(),
                    metrics_output
                )
            } else {
                "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
            };

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "GNSA starting");

    // Load configuration
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    apply_overrides(&mut config, &cli);

    // Validate configuration
    config.validate().context("Invalid configuration")?;
    let node = config.node_identity().context("Invalid configuration")?;
    let mode = config.policy_mode().context("Invalid configuration")?;
    let mask = config.device_mask().context("Invalid configuration")?;

    info!(node = %node, mode = %mode, mask = %mask, dry_run = config.dry_run, "Configuration loaded");

    // Run single pass if --once flag is set
    if cli.once {
        info!("Running single evaluation pass (--once mode)");
        // The in-memory cluster is never called: run_once stops after evaluation
        let cluster = Arc::new(InMemoryCluster::with_nodes(&[node.as_str()]));
        let metrics = Arc::new(MetricsRegistry::new());
        let mut agent = build_agent(&config, node, mode, mask, cluster, metrics);

        let verdict = agent.run_once().await.context("Sampling failed")?;
        info!(
            action = %verdict.action,
            condition = %verdict.condition,
            score = verdict.score,
            device = verdict.selected_device.as_deref().unwrap_or("-"),
            reason = %verdict.reason,
            "Verdict"
        );
        return Ok(());
    }

    // Setup shutdown signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating shutdown");
            }
        }

        let _ = shutdown_tx.send(true);
    });

    // Run main loop
    run(config, node, mode, mask, shutdown_rx).await
}
