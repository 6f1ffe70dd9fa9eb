//! DevTeam orchestration server

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use devteam_agent::ClaudeExecutor;
use devteam_server::checkpoint::CheckpointStore;
use devteam_server::config::{Config, LogFormat};
use devteam_server::{http, AppState, RunService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devteam=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match config.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    let team = config.load_team()?;
    info!(
        roles = team.roles.len(),
        tasks = team.tasks.len(),
        source = %config
            .team_config
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in".to_string()),
        "Team loaded"
    );

    let mut executor = ClaudeExecutor::new(config.claude_path.clone())
        .with_permission_mode(config.permission_mode);
    if let Some(model) = &config.model {
        executor = executor.with_model(model.clone());
    }
    if let Some(timeout) = config.task_timeout() {
        executor = executor.with_timeout(timeout);
    }

    let store = CheckpointStore::new(config.checkpoint_dir.clone(), config.checkpoint_backups);
    let service = RunService::new(team, Arc::new(executor), store, config.retry_policy())?
        .with_write_results(!config.no_write_results)
        .with_run_retention(config.run_retention());
    let state = AppState::new(service);

    let router = http::create_router(state);
    let listener = TcpListener::bind(config.http_addr).await?;

    info!(
        http_addr = %config.http_addr,
        checkpoint_dir = %config.checkpoint_dir.display(),
        max_retries = config.max_retries,
        "DevTeam server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
