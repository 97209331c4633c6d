//! hubsync: dataset sync client
//!
//! Pulls packaged dataset versions from a hubsync hub and installs
//! them with an atomic directory swap. Designed to run from cron: the
//! exit code tells the operator what happened.
//!
//! Exit codes:
//! - 0: every dataset synced or already up to date
//! - 1: at least one dataset failed
//! - 2: configuration error
//! - 3: hub listing endpoint unreachable

use std::path::PathBuf;
use std::process::ExitCode;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, builder::Styles};
use tracing_subscriber::Layer as _;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use hubsync::error::SyncOutcome;
use hubsync::sync::{PlanEntry, SyncClient};
use hubsync_core::config::{ClientConfig, LoggingSection};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "hubsync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Sync packaged datasets from a hubsync hub")]
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
    /// Download and install every dataset that is behind
    Sync {
        /// Only sync this dataset
        #[arg(short, long)]
        dataset: Option<String>,
    },

    /// Report which datasets are behind, without downloading
    Status,

    /// Show version and build info
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error reporting: {e}");
        return ExitCode::from(1);
    }

    let cli = Cli::parse();

    if matches!(&cli.command, Commands::Version) {
        eprintln!("hubsync {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let config = match ClientConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let _log_guard = init_logging(cli.verbose, &config.logging);

    match cli.command {
        Commands::Version => unreachable!("handled above"),
        Commands::Status => status_command(config).await,
        Commands::Sync { dataset } => sync_command(config, dataset).await,
    }
}

async fn sync_command(mut config: ClientConfig, only: Option<String>) -> ExitCode {
    if let Some(name) = &only {
        config.datasets.retain(|d| &d.name == name);
        if config.datasets.is_empty() {
            eprintln!("configuration error: dataset `{name}` is not configured");
            return ExitCode::from(2);
        }
    }

    let mut client = match SyncClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("cannot start sync client: {e:#}");
            return ExitCode::from(1);
        }
    };

    let reports = match client.sync_all().await {
        Ok(reports) => reports,
        Err(e) => {
            eprintln!("cannot reach hub listing endpoint: {e}");
            return ExitCode::from(3);
        }
    };

    let mut failed = 0_usize;
    for report in &reports {
        match &report.result {
            Ok(SyncOutcome::Synced { version }) => {
                eprintln!("{}: synced {}", report.dataset, version.to_rfc3339());
            }
            Ok(SyncOutcome::UpToDate) => {
                eprintln!("{}: up to date", report.dataset);
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: failed: {e}", report.dataset);
            }
        }
    }
    eprintln!(
        "sync completed: {}/{} successful",
        reports.len() - failed,
        reports.len()
    );

    if failed > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

async fn status_command(config: ClientConfig) -> ExitCode {
    let client = match SyncClient::new(config) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("cannot start sync client: {e:#}");
            return ExitCode::from(1);
        }
    };

    let plan = match client.plan().await {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("cannot reach hub listing endpoint: {e}");
            return ExitCode::from(3);
        }
    };

    for (name, entry) in plan {
        let status = match entry {
            PlanEntry::Behind => "behind",
            PlanEntry::Current => "current",
            PlanEntry::NotPublished => "not published",
        };
        eprintln!("{name}: {status}");
    }

    ExitCode::SUCCESS
}

/// Console logging, plus a file layer when `logging.file` is set
///
/// The returned guard must stay alive for the program's duration so
/// buffered file output is flushed.
fn init_logging(
    verbose: bool,
    logging: &LoggingSection,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".to_string())
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match &logging.file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
            let file_name = path
                .file_name()
                .map_or_else(|| "hubsync.log".into(), |n| n.to_os_string());
            if let Some(dir) = dir {
                let _ = std::fs::create_dir_all(dir);
            }

            let appender = tracing_appender::rolling::never(
                dir.unwrap_or_else(|| std::path::Path::new(".")),
                file_name,
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            let console_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false);

            tracing_subscriber::registry()
                .with(console_layer.and_then(file_layer).with_filter(filter))
                .init();

            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
            None
        }
    }
}
