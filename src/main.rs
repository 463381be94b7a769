//! Model Warden - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use model_warden::{
    ExternalActivityDetector, HfHubDownloader, ModelId, ReadinessCoordinator, api,
    config::WardenConfig, metrics, models::CacheLocator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "model-warden")]
#[command(about = "Model artifact cache readiness service", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API (default)
    Serve {
        /// Override API port
        #[arg(long)]
        port: Option<u16>,

        /// Start preparing the default model right away
        #[arg(long)]
        warm: bool,
    },
    /// Print the cache status of every supported model
    Status,
    /// Make a model ready, downloading it if needed
    Ensure {
        /// Model id or repository (defaults to the configured model)
        model: Option<String>,
    },
    /// Remove interrupted downloads and invalid model directories
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for command output
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }

    let mut config = WardenConfig::load(cli.config)?;

    let command = cli.command.unwrap_or(Command::Serve {
        port: None,
        warm: false,
    });

    // CLI overrides
    if let Command::Serve {
        port: Some(port), ..
    } = &command
    {
        config.api_port = *port;
    }

    config.validate()?;

    tracing::info!(
        api_port = config.api_port,
        default_model = %config.default_model,
        cache_roots = ?config.resolved_cache_roots(),
        "Configuration loaded"
    );

    match command {
        Command::Serve { warm, .. } => serve(config, warm).await,
        Command::Status => status(&config).await,
        Command::Ensure { model } => ensure(&config, model).await,
        Command::Clean => clean(&config).await,
    }
}

fn build_coordinator(config: &WardenConfig) -> ReadinessCoordinator {
    let locator = Arc::new(CacheLocator::new(config.locator_config()));
    let detector = Arc::new(ExternalActivityDetector::with_system_probe(
        config.external_config(),
    ));
    let downloader = Arc::new(HfHubDownloader::new(config.resolved_download_dir()));

    ReadinessCoordinator::new(config.coordinator_config(), locator, detector, downloader)
}

async fn serve(config: WardenConfig, warm: bool) -> Result<()> {
    tracing::info!("Starting Model Warden");

    // Setup metrics
    let prometheus_handle = metrics::setup_metrics()?;

    let coordinator = build_coordinator(&config);

    if warm {
        let warm_coordinator = coordinator.clone();
        let model = config.default_model;
        tokio::spawn(async move {
            if let Err(failure) = warm_coordinator.request_ready(model.descriptor()).await {
                tracing::warn!(
                    model = %model,
                    class = failure.class.category(),
                    "Warm-up acquisition failed"
                );
            }
        });
    }

    // Setup API
    let app_state = api::AppState {
        coordinator: coordinator.clone(),
        prometheus_handle,
    };

    let app = api::create_router(app_state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.api_port));
    tracing::info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind API server")?;

    // Graceful shutdown; cancelling the coordinator releases long-polling waiters
    let signal_coordinator = coordinator.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_coordinator.shutdown();
        })
        .await
        .context("API server error")?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn status(config: &WardenConfig) -> Result<()> {
    let locator = CacheLocator::new(config.locator_config());
    let models = tokio::task::spawn_blocking(move || {
        ModelId::ALL
            .iter()
            .map(|id| api::models::ModelInfo::inspect(&locator, id.descriptor()))
            .collect::<Vec<_>>()
    })
    .await
    .context("Cache inspection failed")?;

    println!("{}", serde_json::to_string_pretty(&models)?);
    Ok(())
}

async fn ensure(config: &WardenConfig, model: Option<String>) -> Result<()> {
    let id: ModelId = match model {
        Some(model) => model.parse().context("Unknown model")?,
        None => config.default_model,
    };

    let coordinator = build_coordinator(config);

    let outcome = tokio::select! {
        outcome = coordinator.request_ready(id.descriptor()) => outcome,
        _ = shutdown_signal() => {
            coordinator.shutdown();
            anyhow::bail!("Interrupted");
        }
    };

    match outcome {
        Ok(ready) => {
            println!("{}", serde_json::to_string_pretty(&ready)?);
            Ok(())
        }
        Err(failure) => {
            tracing::error!(
                model = %id,
                class = failure.class.category(),
                attempts = failure.attempts,
                error = %failure.error,
                "Model is not ready"
            );
            anyhow::bail!("{}", failure.class.user_message())
        }
    }
}

async fn clean(config: &WardenConfig) -> Result<()> {
    let coordinator = build_coordinator(config);
    let report = coordinator.clear_cache().await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.failed.is_empty() {
        anyhow::bail!("{} entries could not be removed", report.failed.len());
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
