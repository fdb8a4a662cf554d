//! agentmesh hub - main entry point

use agentmesh::config::{InferenceProvider, MeshConfig, RegistryBackend};
use agentmesh::inference::{InferenceService, LlmInference, RuleOnlyInference};
use agentmesh::llm::providers::{OpenAiConfig, OpenAiProvider};
use agentmesh::monitor::WebhookNotifier;
use agentmesh::observability::logging::{init_default_logging, init_logging, LogFormat};
use agentmesh::observability::metrics::metrics;
use agentmesh::pipeline::ModerationRequest;
use agentmesh::registry::{AgentStore, MemoryAgentStore, RedisAgentStore};
use agentmesh::transport::{grpc, http};
use agentmesh::worker::{default_roster, spawn_roster};
use agentmesh::{
    ApiKeyAuth, Arbitrator, CommunicationHub, Coordinator, LivenessMonitor, ModerationPipeline,
    TaskBoard, TaskRouter,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Multi-agent coordination hub
#[derive(Parser)]
#[command(name = "agentmesh")]
#[command(about = "Multi-agent coordination hub with consensus arbitration")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub, workers, monitor and transports
    Serve,
    /// Moderate one piece of content in-process and print the outcome
    Moderate {
        content: String,
        #[arg(long, default_value = "general")]
        platform: String,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

/// Everything `serve` and `moderate` share
struct Node {
    hub: Arc<CommunicationHub>,
    registry: Arc<dyn AgentStore>,
    coordinator: Arc<Coordinator>,
    inference: Arc<dyn InferenceService>,
    pipeline: Arc<ModerationPipeline>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_observability(cli.verbose);

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Moderate { content, platform } => moderate(config, content, platform).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn init_observability(verbose: u8) {
    let level = match verbose {
        0 => return init_default_logging(),
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
    init_logging(level, format, false);
}

fn load_configuration(path: Option<&PathBuf>) -> Result<MeshConfig, Box<dyn std::error::Error>> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(MeshConfig::load_from_file(path)?);
    }

    for candidate in ["agentmesh.toml", "config/agentmesh.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(MeshConfig::load_from_file(&path)?);
        }
    }

    warn!("No configuration file found, using defaults");
    let mut config = MeshConfig::with_defaults("agentmesh");
    config.apply_overrides(|var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

async fn build_registry(config: &MeshConfig) -> Result<Arc<dyn AgentStore>, Box<dyn std::error::Error>> {
    match (config.registry.backend, config.registry.redis_url.as_deref()) {
        (RegistryBackend::Redis, Some(url)) => {
            let store = RedisAgentStore::connect(url, &config.registry.namespace).await?;
            Ok(Arc::new(store))
        }
        (RegistryBackend::Redis, None) => Err("registry.backend = \"redis\" needs redis_url".into()),
        (RegistryBackend::Memory, _) => Ok(Arc::new(MemoryAgentStore::new())),
    }
}

fn build_inference(config: &MeshConfig) -> Result<Arc<dyn InferenceService>, Box<dyn std::error::Error>> {
    match config.inference.provider {
        InferenceProvider::None => {
            info!("No inference backend configured, using rule-based fallbacks");
            Ok(Arc::new(RuleOnlyInference))
        }
        InferenceProvider::Openai => {
            let mut openai = OpenAiConfig {
                api_key: config.inference_api_key()?,
                timeout: Duration::from_secs(config.inference.timeout_secs),
                ..Default::default()
            };
            if let Some(base_url) = &config.inference.base_url {
                openai.base_url = base_url.clone();
            }
            let provider = OpenAiProvider::new(openai)?;
            Ok(Arc::new(LlmInference::new(
                Arc::new(provider),
                config.llm_inference_config(),
            )))
        }
    }
}

async fn build_node(config: &MeshConfig) -> Result<Node, Box<dyn std::error::Error>> {
    let hub = Arc::new(CommunicationHub::new());
    let registry = build_registry(config).await?;
    let board = Arc::new(TaskBoard::new());
    let auth = ApiKeyAuth::from_env(&config.auth.api_keys_env);
    let coordinator = Arc::new(Coordinator::new(
        auth,
        registry.clone(),
        board,
        hub.clone(),
    ));
    let inference = build_inference(config)?;

    let router = Arc::new(TaskRouter::new(
        hub.clone(),
        registry.clone(),
        inference.clone(),
        config.router_settings(),
    ));
    let arbitrator = Arc::new(Arbitrator::new(
        hub.clone(),
        inference.clone(),
        config.arbitrator_settings(),
    ));
    let pipeline = Arc::new(ModerationPipeline::new(router, arbitrator));

    Ok(Node {
        hub,
        registry,
        coordinator,
        inference,
        pipeline,
    })
}

async fn serve(config: MeshConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        node_id = %config.node.id,
        version = env!("CARGO_PKG_VERSION"),
        "Starting agentmesh hub"
    );

    let node = build_node(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    let mut monitor = LivenessMonitor::new(node.coordinator.clone(), config.monitor_settings());
    if let Some(url) = &config.notify.webhook_url {
        monitor = monitor.with_notifier(WebhookNotifier::new(url.clone())?);
    }
    tasks.push(monitor.spawn(shutdown_rx.clone()));

    if config.workers.enabled {
        let workers = spawn_roster(
            default_roster(),
            node.hub.clone(),
            node.registry.clone(),
            node.inference.clone(),
            Duration::from_secs(config.workers.heartbeat_interval_secs),
            shutdown_rx.clone(),
        )
        .await?;
        info!(count = workers.len(), "Built-in worker roster started");
        tasks.extend(workers);
    }

    if config.transport.http_enabled {
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        let (addr, server) = http::bind_gateway(
            node.coordinator.clone(),
            Some(node.pipeline.clone()),
            config.http_addr()?,
            shutdown,
        )?;
        info!(addr = %addr, "HTTP gateway started");
        tasks.push(tokio::spawn(server));
    }

    if config.transport.grpc_enabled {
        let listener = TcpListener::bind(config.grpc_addr()?).await?;
        let coordinator = node.coordinator.clone();
        let shutdown = wait_for_shutdown(shutdown_rx.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = grpc::serve(coordinator, listener, shutdown).await {
                error!("gRPC adapter error: {}", e);
            }
        }));
    }

    wait_for_signal().await?;

    info!("Shutdown initiated");
    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }

    let snapshot = metrics().get_metrics();
    info!(
        messages_sent = snapshot.messages_sent,
        tasks_completed = snapshot.tasks.completed,
        decisions = snapshot.decisions.by_decision.values().sum::<u64>(),
        "Hub stopped"
    );
    Ok(())
}

async fn moderate(
    config: MeshConfig,
    content: String,
    platform: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let node = build_node(&config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = spawn_roster(
        default_roster(),
        node.hub.clone(),
        node.registry.clone(),
        node.inference.clone(),
        Duration::from_secs(config.workers.heartbeat_interval_secs),
        shutdown_rx,
    )
    .await?;

    let outcome = node
        .pipeline
        .moderate(ModerationRequest::new(content).with_platform(platform))
        .await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    let _ = shutdown_tx.send(true);
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}

fn handle_config_command(config: &MeshConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;
    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            break;
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down gracefully...");
    Ok(())
}
