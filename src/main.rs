//! llama-supervisor - Main entry point

use anyhow::{Context, Result};
use clap::Parser;
use llama_supervisor::gpu::{GpuProbe, NvidiaSmi};
use llama_supervisor::process::{ProcessManager, SystemProcessManager};
use llama_supervisor::{
    ArtifactDownloader, LlamaServer, ModelSwapManager, Role, RuntimeAssets, SupervisorConfig,
    VisionServer, Watchdog, metrics,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "llama-supervisor")]
#[command(about = "Local supervisor for llama.cpp inference servers", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override llama-server port
    #[arg(long)]
    port: Option<u16>,

    /// Role to load at startup (chat, vision, coder)
    #[arg(long)]
    role: Option<Role>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Disable automatic restarts
    #[arg(long)]
    no_watchdog: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .json()
                .init();
        }
    }

    tracing::info!("Starting llama-supervisor");

    let mut config = SupervisorConfig::load(cli.config)?;

    // CLI overrides
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if cli.role.is_some() {
        config.initial_role = cli.role;
    }
    if cli.no_watchdog {
        config.watchdog.enabled = false;
    }

    config.validate()?;

    tracing::info!(
        port = config.server.port,
        data_dir = ?config.server.data_dir,
        vram_strategy = %config.server.vram_strategy,
        vision_port = config.vision.port,
        watchdog = config.watchdog.enabled,
        "Configuration loaded"
    );

    let metrics_addr = cli
        .metrics_port
        .map(|port| std::net::SocketAddr::from(([0, 0, 0, 0], port)));
    let _prometheus_handle = metrics::setup_metrics(metrics_addr)?;

    let assets = RuntimeAssets::discover(
        config.server.binary_path.as_deref(),
        config.server.library_path.as_deref(),
        &config.server.data_dir,
    )
    .context("llama-server runtime not found")?;
    tracing::info!(binary = ?assets.binary, library_dir = ?assets.library_dir, "Runtime located");

    let models_dir = config.server.models_dir();

    if !config.artifacts.is_empty() {
        let downloader = ArtifactDownloader::new(config.download.clone())
            .context("Failed to build HTTP client")?;
        for artifact in &config.artifacts {
            if models_dir.join(&artifact.filename).is_file() {
                tracing::debug!(filename = %artifact.filename, "Artifact present");
                continue;
            }
            match downloader
                .download(&artifact.url, &models_dir, &artifact.filename, None)
                .await
            {
                Ok(outcome) => {
                    tracing::info!(path = ?outcome.path, bytes = outcome.bytes, "Artifact ready")
                }
                Err(e) => tracing::error!(
                    filename = %artifact.filename,
                    resumable = e.is_resumable(),
                    error = %e,
                    "Artifact download failed"
                ),
            }
        }
    }

    let process_manager: Arc<dyn ProcessManager> = Arc::new(SystemProcessManager::new());
    let gpu: Arc<dyn GpuProbe> = Arc::new(NvidiaSmi::new());

    let server = Arc::new(LlamaServer::with_components(
        config.server.clone(),
        Some(assets.clone()),
        process_manager.clone(),
        gpu.clone(),
    ));

    let swap = Arc::new(ModelSwapManager::new(
        server.clone(),
        config.roles.clone(),
        config.swap.clone(),
    ));
    if config.roles.auto_detect {
        swap.auto_detect(&models_dir).await;
    }

    let vision = if config.vision.enabled {
        let mut vision_config = config.vision.clone();
        if vision_config.model_path.is_none() {
            let info = swap.vision_model_info().await;
            vision_config.model_path = info.model;
            vision_config.mmproj_path = vision_config.mmproj_path.or(info.mmproj);
        }
        tracing::info!(
            port = vision_config.port,
            model = ?vision_config.model_path,
            "Vision server available on demand"
        );
        Some(
            VisionServer::new(vision_config, assets, process_manager, gpu)
                .with_log_dir(config.server.data_dir.join("logs")),
        )
    } else {
        None
    };

    if let Some(role) = config.initial_role {
        match swap.ensure_role_loaded(role).await {
            Ok(elapsed) => tracing::info!(role = %role, elapsed_secs = elapsed.as_secs_f64(), "Initial model loaded"),
            Err(e) => tracing::error!(role = %role, error = %e, "Failed to load initial model"),
        }
    }

    let watchdog = if config.watchdog.enabled {
        let watchdog = Arc::new(Watchdog::new(server.clone(), config.watchdog.clone()));
        watchdog
            .set_restart_observer(Arc::new(|reason, attempt| {
                tracing::warn!(reason = %reason, attempt, "Watchdog restarting llama-server");
            }))
            .await;
        watchdog.start().await?;
        Some(watchdog)
    } else {
        None
    };

    shutdown_signal().await;

    tracing::info!("Shutting down...");

    if let Some(watchdog) = &watchdog {
        watchdog.stop().await;
    }

    if let Some(vision) = &vision
        && let Err(e) = vision.stop().await
    {
        tracing::error!(error = %e, "Failed to stop vision server during shutdown");
    }

    if let Err(e) = server.stop().await {
        tracing::error!(error = %e, "Failed to stop llama-server during shutdown");
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
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
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
