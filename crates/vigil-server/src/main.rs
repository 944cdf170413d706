use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use vigil_storage::bulk::KeyedLocks;
use vigil_storage::sqlite::SqliteStore;

use vigil_server::app::{self, Runtime};
use vigil_server::config::ServerConfig;
use vigil_server::seed::{self, RulesSeedFile};

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  vigil-server [config.toml]                             Start the server");
    eprintln!("  vigil-server init-rules <config.toml> <seed.json>      Create or update alert rules from seed file");
    eprintln!("  vigil-server delete-rules <config.toml> <seed.json>    Delete the alert rules listed in seed file");
    eprintln!("  vigil-server test-notify <config.toml> <url>           Send a test notification to one delivery URL");
}

#[tokio::main]
async fn main() -> Result<()> {
    vigil_common::id::init(vigil_common::id::WorkerId::DEFAULT);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("vigil=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some(command @ ("init-rules" | "delete-rules")) => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("{command} requires <config.toml> and <seed.json> arguments")
            })?;
            let seed_path = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("{command} requires <seed.json> argument")
            })?;
            run_seed(command, config_path, seed_path).await
        }
        Some("test-notify") => {
            let config_path = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("test-notify requires <config.toml> and <url> arguments")
            })?;
            let url = args.get(3).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("test-notify requires <url> argument")
            })?;
            run_test_notify(config_path, url).await
        }
        Some("--help" | "-h") => {
            print_usage();
            Ok(())
        }
        _ => {
            let config_path = args
                .get(1)
                .map(|s| s.as_str())
                .unwrap_or("config/server.toml");
            run_server(config_path).await
        }
    }
}

fn open_store(config: &ServerConfig) -> Result<Arc<SqliteStore>> {
    let path = config.database_path();
    let store = SqliteStore::open(&path)
        .map_err(|e| anyhow::anyhow!("Failed to open database '{}': {}", path.display(), e))?;
    Ok(Arc::new(store))
}

/// Applies or removes the rules of a JSON seed file.
async fn run_seed(command: &str, config_path: &str, seed_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = open_store(&config)?;
    let seed = RulesSeedFile::load(seed_path)?;
    let locks = KeyedLocks::new();

    let summary = if command == "delete-rules" {
        seed::remove_rules(store.as_ref(), &locks, &seed).await
    } else {
        seed::apply_rules(store.as_ref(), &locks, &seed).await?
    };

    tracing::info!(
        user_id = %seed.user_id,
        created = summary.created,
        updated = summary.updated,
        skipped = summary.skipped,
        removed = summary.removed,
        failed = summary.failed,
        "Rule seed finished"
    );
    if summary.failed > 0 {
        anyhow::bail!("{} rule request(s) were rejected", summary.failed);
    }
    Ok(())
}

async fn run_test_notify(config_path: &str, url: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    let store = open_store(&config)?;
    let dispatcher = app::build_dispatcher(&config, store)?;
    dispatcher.send_test(url).await?;
    tracing::info!("Test notification delivered");
    Ok(())
}

async fn run_server(config_path: &str) -> Result<()> {
    let config = ServerConfig::load(config_path)?;
    tracing::info!(
        database = %config.database_path().display(),
        app_url = %config.app_url,
        "Starting vigil-server"
    );

    let store = open_store(&config)?;
    let dispatcher = app::build_dispatcher(&config, store.clone())?;
    let runtime = Runtime::start(&config, store, dispatcher).await?;

    if let Err(e) = signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutting down gracefully");

    runtime.shutdown().await;
    tracing::info!("Server stopped");

    Ok(())
}
