//! hubsync-hub: dataset distribution hub
//!
//! Watches configured dataset directories, packages settled versions
//! into a cache of zip archives, and serves them over HTTP:
//! - `GET /api/datasets`: listing of dataset versions
//! - `GET /package/{name}.zip`: Range-capable archive download
//! - `GET /health`: liveness probe

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::WrapErr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use hubsync_core::config::HubConfig;
use hubsync_core::state::StateStore;

use hubsync_hub::http::{self, ApiContext};
use hubsync_hub::packager::Packager;
use hubsync_hub::readers::ReaderRegistry;
use hubsync_hub::scheduler::{DatasetOutcome, Scheduler};

/// How long in-flight downloads may drain after a shutdown signal
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "hubsync-hub")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Dataset distribution hub: package settled datasets, serve them over HTTP")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "hubsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and HTTP server until interrupted
    Serve,

    /// Run exactly one freshness pass and exit
    Check,

    /// Print the persisted per-dataset state
    Status,

    /// Show version and build info
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Version => {
            eprintln!("hubsync-hub {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Status => {
            status_command(&cli.config)?;
        }
        Commands::Check => {
            check_command(&cli.config).await?;
        }
        Commands::Serve => {
            serve_command(&cli.config).await?;
        }
    }

    Ok(())
}

async fn serve_command(config_path: &PathBuf) -> Result<()> {
    let config = Arc::new(HubConfig::load(config_path)?);

    // A missing cache directory is a global error at startup
    std::fs::create_dir_all(&config.server.cache_dir)
        .wrap_err_with(|| format!("creating cache dir {}", config.server.cache_dir.display()))?;

    let store = Arc::new(StateStore::load(&config.state_file)?);
    let readers = Arc::new(ReaderRegistry::new());
    let packager = Arc::new(Packager::new(
        config.server.cache_dir.clone(),
        config.packaging.keep_versions,
        readers.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(
        config.clone(),
        store.clone(),
        packager,
        shutdown_rx.clone(),
    );
    let scheduler_task = tokio::spawn(scheduler.run());

    let ctx = Arc::new(ApiContext {
        store,
        readers,
        dataset_names: config.datasets.iter().map(|d| d.name.clone()).collect(),
    });
    let app = http::router(ctx);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    info!("listening on http://{addr}");

    let mut drain_rx = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = drain_rx.changed().await;
            })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Let in-flight downloads drain, but only up to the deadline
    match tokio::time::timeout(DRAIN_DEADLINE, server_task).await {
        Ok(joined) => joined??,
        Err(_) => warn!("drain deadline exceeded, closing remaining connections"),
    }
    let _ = scheduler_task.await;

    info!("hub stopped");
    Ok(())
}

async fn check_command(config_path: &PathBuf) -> Result<()> {
    let config = Arc::new(HubConfig::load(config_path)?);
    std::fs::create_dir_all(&config.server.cache_dir)?;

    let store = Arc::new(StateStore::load(&config.state_file)?);
    let packager = Arc::new(Packager::new(
        config.server.cache_dir.clone(),
        config.packaging.keep_versions,
        Arc::new(ReaderRegistry::new()),
    ));
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(config, store, packager, shutdown_rx);
    let outcomes = scheduler.run_pass().await;

    for (name, outcome) in outcomes {
        match outcome {
            DatasetOutcome::Packaged {
                version,
                file_count,
                package_size,
            } => eprintln!(
                "{name}: packaged {} ({file_count} files, {package_size} bytes)",
                version.to_rfc3339()
            ),
            other => eprintln!("{name}: {other:?}"),
        }
    }

    Ok(())
}

fn status_command(config_path: &PathBuf) -> Result<()> {
    let config = HubConfig::load(config_path)?;
    let store = StateStore::load(&config.state_file)?;
    let states = store.get_all();

    for dataset in &config.datasets {
        match states.get(&dataset.name) {
            Some(state) => {
                let version = state
                    .last_updated
                    .map_or_else(|| "-".to_string(), |t| t.to_rfc3339());
                eprintln!(
                    "{}: version={version} files={} ready={} package_size={}",
                    dataset.name, state.file_count, state.package_ready, state.package_size
                );
            }
            None => eprintln!("{}: never packaged", dataset.name),
        }
    }

    Ok(())
}
