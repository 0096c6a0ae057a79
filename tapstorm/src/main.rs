use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tapstorm::{
    api_server::spawn_api_server,
    cli::{Cli, Commands, StartArgs, StatusArgs},
    config::ServiceConfig,
    metrics::register_metrics,
    storage::MemoryStore,
    telemetry::setup_telemetry,
    ServiceContext,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => start(args).await,
        Commands::Status(args) => status(args).await,
    }
}

async fn start(args: StartArgs) -> anyhow::Result<()> {
    setup_telemetry();
    register_metrics();

    let config = ServiceConfig::from_start_args(&args);
    info!(
        port = config.general.api_port,
        waiting_secs = config.timing.waiting_period_secs,
        game_secs = config.timing.game_duration_secs,
        "starting tapstorm coordinator"
    );

    let store = Arc::new(MemoryStore::new());
    let ctx = ServiceContext::new(config, store);

    let background = ctx.spawn_background_tasks();
    let _guard = scopeguard::guard(background, |handles| {
        info!("aborting coordinator background tasks");
        for handle in handles {
            handle.abort();
        }
    });

    let api = spawn_api_server(
        ctx.clone(),
        ctx.config.general.api_port,
        ctx.config.general.allow_public_bind,
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");
    api.shutdown();
    Ok(())
}

async fn status(args: StatusArgs) -> anyhow::Result<()> {
    let url = format!("{}/status", args.api_url.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?;
    let body: serde_json::Value = response
        .json()
        .await
        .context("status endpoint returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
