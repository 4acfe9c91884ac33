use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use applianced::Config;
use applianced::StateStore;
use applianced::UpdateCoordinator;
use applianced::api;
use applianced::config::LoggingConfig;
use applianced::coordinator::channel;
use applianced::entity::attach_entities;
use applianced::sources::start_sources;
use clap::Parser;
use tokio::sync::oneshot;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Appliance update coordinator daemon
#[derive(Parser, Debug)]
#[command(name = "applianced")]
#[command(about = "Bridges appliance push updates to host entity state")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "applianced.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = logging.overrides.iter().fold(
        Targets::new().with_default(LevelFilter::from(logging.level)),
        |filter, (target, level)| filter.with_target(target.clone(), LevelFilter::from(*level)),
    );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;

    init_tracing(&config.logging);

    if args.check {
        tracing::info!("Configuration {} is valid", args.config.display());
        return Ok(());
    }

    tracing::info!("applianced starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let store = Arc::new(StateStore::new());
    let mut coordinator = UpdateCoordinator::new(config.coordinator.name.clone(), store.clone());
    attach_entities(&mut coordinator, &config.appliances)
        .context("Failed to attach configured entities")?;

    let (bridge, bridge_rx) = channel(config.coordinator.queue_capacity);
    let (coordinator_shutdown_tx, coordinator_shutdown_rx) = oneshot::channel();
    let coordinator_task = tokio::spawn(coordinator.run(bridge_rx, coordinator_shutdown_rx));

    let sources = start_sources(&config, &bridge);

    let api = config.api.as_ref().map(|api_config| {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(api::serve(
            api_config.listen.clone(),
            api_config.port,
            store.clone(),
            bridge.clone(),
            shutdown_rx,
        ));
        (shutdown_tx, task)
    });

    tracing::info!("Press Ctrl+C to exit");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    if let Some((shutdown_tx, task)) = api {
        let _ = shutdown_tx.send(());
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("HTTP API server failed: {:#}", e),
            Err(e) => tracing::error!("HTTP API task panicked: {}", e),
        }
    }

    tracing::info!("Stopping {} push source(s)...", sources.len());
    tokio::task::spawn_blocking(move || {
        for source in sources {
            source.shutdown();
        }
    })
    .await
    .context("Push source shutdown panicked")?;

    drop(bridge);
    let _ = coordinator_shutdown_tx.send(());
    let coordinator = coordinator_task
        .await
        .context("Coordinator task panicked")?;
    tracing::info!(
        "Coordinator {} stopped with {} appliance(s) seen",
        coordinator.name(),
        coordinator.overview().len()
    );

    tracing::info!("applianced shutdown complete");

    Ok(())
}
