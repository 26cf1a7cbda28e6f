use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use favsongs_server::account_tracker::TrackerDeps;
use favsongs_server::clock::{Clock, SystemClock};
use favsongs_server::config::{self, ServerConfig};
use favsongs_server::events::EventBus;
use favsongs_server::scheduler::TrackerManager;
use favsongs_server::spotify::{SpotifyClient, StoredCredentials};
use favsongs_server::tracker_db::TrackerDb;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("FAVSONGS_GIT_SHA"),
    ", ",
    env!("FAVSONGS_BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "favsongs-server", version = VERSION)]
struct Args {
    /// Optional server config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides config)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<ServerConfig> {
    if let Some(path) = args.config.as_ref() {
        return ServerConfig::load(path);
    }
    let auto_path = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")))
        .filter(|path| path.exists());
    match auto_path {
        Some(path) => ServerConfig::load(&path),
        None => Ok(ServerConfig::default()),
    }
}

/// Cancel `shutdown` on Ctrl-C. Fails if a handler is already installed.
fn install_shutdown_handler(shutdown: &CancellationToken) -> Result<()> {
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.cancel()).context("install Ctrl-C handler")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,favsongs_server=info")),
        )
        .init();

    let cfg = load_config(&args)?;
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| config::db_path_from_config(&cfg));
    let defaults = config::defaults_from_config(&cfg)?;
    let cache_ttl_ms = config::cache_ttl_from_config(&cfg)?;
    let provider_cfg = config::provider_from_config(&cfg)?;
    tracing::info!(
        version = VERSION,
        db_path = %db_path.display(),
        api_base_url = %provider_cfg.api_base_url,
        "starting favsongs-server"
    );

    let db = Arc::new(TrackerDb::open(&db_path, defaults)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let credentials = Arc::new(StoredCredentials::new(db.clone(), clock.clone()));
    let provider = Arc::new(SpotifyClient::new(&provider_cfg, credentials)?);
    let events = EventBus::new();
    let manager = TrackerManager::new(TrackerDeps {
        store: db.clone(),
        provider,
        clock,
        events,
        cache_ttl_ms,
    });

    let shutdown = CancellationToken::new();
    install_shutdown_handler(&shutdown)?;

    let accounts = db.list_accounts()?;
    let resumed = manager.start_saved()?;
    tracing::info!(accounts = accounts.len(), resumed, "trackers resumed");

    shutdown.cancelled().await;

    tracing::info!("shutting down trackers");
    manager.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_handler_installs_once() {
        let shutdown = CancellationToken::new();
        install_shutdown_handler(&shutdown).unwrap();

        let err = install_shutdown_handler(&shutdown).unwrap_err();
        assert!(format!("{err:#}").contains("install Ctrl-C handler"));
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn explicit_config_path_must_exist() {
        let args = Args::parse_from([
            "favsongs-server",
            "--config",
            "/nonexistent/favsongs/config.toml",
        ]);
        assert!(load_config(&args).is_err());
    }
}
