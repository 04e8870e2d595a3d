//! Entry point: `serve` boots the fleet supervisor daemon (MQTT clients,
//! catalogue sync, control loop, admin API); every other subcommand is a
//! thin HTTP client against an already-running daemon's admin API.

mod admin;
mod batch;
mod catalogue;
mod cli;
mod config;
mod control_loop;
mod db;
mod errors;
mod fleet;
mod lock;
mod message;
mod node_client;
mod status_bus;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use cli::{Cli, Command};
use config::Settings;
use db::Db;
use fleet::FleetSupervisor;
use lock::{LockBreakPolicy, OwnershipLocker};
use status_bus::StatusBus;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);

    if !matches!(command, Command::Serve) {
        return cli::run_client_command(&cli.admin_url, command).await;
    }

    serve().await
}

async fn serve() -> Result<()> {
    let settings = Settings::from_env();

    let db = Db::connect(&settings.database_url)
        .await
        .context("failed to connect to database")?;
    db.migrate().await.context("failed to run migrations")?;

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    match config::load(&config_path) {
        Ok(seed) => config::apply(&seed, &db).await?,
        Err(e) => warn!("no node seed file applied: {e:#}"),
    }

    let locker = Arc::new(
        OwnershipLocker::connect(
            &settings.redis_url,
            Duration::from_secs(settings.lock_ttl_sec),
            LockBreakPolicy::OnTtlExpiredOnly,
        )
        .await
        .context("failed to connect ownership locker to redis")?,
    );
    info!(instance_id = %locker.instance_id, "supervisor instance identity assigned");

    let status_bus = Arc::new(
        StatusBus::connect(
            &settings.redis_url,
            Duration::from_millis(settings.status_throttle_ms),
            Duration::from_millis(settings.ws_throttle_ms),
        )
        .await
        .context("failed to connect status bus to redis")?,
    );

    let fleet = Arc::new(FleetSupervisor::new(
        db.clone(),
        Arc::clone(&status_bus),
        Arc::clone(&locker),
        settings.batch_size,
        Duration::from_millis(settings.batch_age_ms),
        Duration::from_secs((settings.health_silence_min * 60).max(0) as u64),
        Duration::from_secs((settings.health_connecting_min * 60).max(0) as u64),
        Duration::from_millis(settings.status_throttle_ms),
    ));

    let started = fleet.start_all().await.context("initial fleet start failed")?;
    info!(started, "initial fleet start complete");

    let mut control_handles = control_loop::spawn_all(Arc::clone(&fleet), db.clone());

    let admin_state = admin::AdminState {
        fleet: Arc::clone(&fleet),
    };
    let mut admin_handle = {
        let bind_addr = settings.admin_bind_addr;
        let port = settings.admin_port;
        tokio::spawn(async move {
            if let Err(e) = admin::serve(bind_addr, port, admin_state).await {
                error!("admin api exited: {e:#}");
            }
        })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason: &str;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
            result = &mut admin_handle => {
                error!("admin api task exited unexpectedly: {result:?}");
                exit_reason = "admin api task died";
                break;
            }
        }
    }

    warn!(signal = exit_reason, "shutting down — stopping all node clients");
    if let Err(e) = fleet.stop_all().await {
        error!("error stopping fleet during shutdown: {e}");
    }
    for handle in control_handles.drain(..) {
        handle.abort();
    }

    info!("shutdown complete");
    Ok(())
}
