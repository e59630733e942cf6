//! store-backup CLI - back up and restore storage accounts.

mod fill;

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use store_backup::{
    BackupError, Config, Orchestrator, RestoreRequest, RunReport, RunStatus, SnapshotWindow,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "store-backup")]
#[command(about = "Back up and restore blob containers and tables between storage accounts")]
#[command(version)]
struct Cli {
    /// Back up tables and containers from source to destination
    #[arg(short, long)]
    backup: bool,

    /// Restore table snapshots taken between --from and --to
    #[arg(short, long)]
    restore: bool,

    /// Fill the source account with dummy tables and containers first
    #[arg(short, long)]
    fill_storage: bool,

    /// Tables to back up or restore, comma-separated ("*" for all)
    #[arg(short, long)]
    tables: Option<String>,

    /// Containers to back up, comma-separated ("*" for all)
    #[arg(short, long)]
    containers: Option<String>,

    /// Connection string of the production account
    #[arg(short, long, required_unless_present = "config")]
    source: Option<String>,

    /// Connection string of the backup account
    #[arg(short, long, required_unless_present = "config")]
    destination: Option<String>,

    /// Connection string of the account holding the operation ledger
    #[arg(long)]
    operational: Option<String>,

    /// Start of the restore window, UTC (e.g. 2024-01-01T00:00:00)
    #[arg(long)]
    from: Option<String>,

    /// End of the restore window, UTC, exclusive
    #[arg(long)]
    to: Option<String>,

    /// Path to YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output JSON run reports to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    verbosity: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), BackupError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = build_config(&cli)?;

    if !cli.fill_storage && !cli.backup && !cli.restore {
        return Err(BackupError::Config(
            "nothing to do: pass --backup, --restore or --fill-storage".to_string(),
        ));
    }

    // Validated before any account is touched
    let request = if cli.restore {
        Some(restore_request(&cli, &config)?)
    } else {
        None
    };

    let cancel_token = setup_signal_handler()?;
    let orchestrator = Orchestrator::new(config).await?;

    if cli.fill_storage {
        let filled = fill::fill_storage(orchestrator.production_account()).await?;
        if !cli.output_json {
            println!(
                "Filled {} tables and {} containers",
                filled.tables.len(),
                filled.containers.len()
            );
        }
    }

    if cli.backup {
        let report = orchestrator.backup(cancel_token.clone()).await?;
        print_report(&report, cli.output_json)?;
        check_cancelled(&report)?;
    }

    if let Some(request) = request {
        let report = orchestrator.restore(&request, cancel_token.clone()).await?;
        print_report(&report, cli.output_json)?;
        check_cancelled(&report)?;
    }

    Ok(())
}

/// Merge the config file, if any, with command-line overrides, then
/// validate the result.
fn build_config(cli: &Cli) -> Result<Config, BackupError> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load_partial(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::new(String::new(), String::new()),
    };

    if let Some(source) = &cli.source {
        config.production = source.clone();
    }
    if let Some(destination) = &cli.destination {
        config.backup = destination.clone();
    }
    if let Some(operational) = &cli.operational {
        config.operational = Some(operational.clone());
    }
    if let Some(tables) = &cli.tables {
        config.pipeline.tables = Some(tables.clone());
    }
    if let Some(containers) = &cli.containers {
        config.pipeline.containers = Some(containers.clone());
    }

    config.validate()?;
    Ok(config)
}

fn restore_request(cli: &Cli, config: &Config) -> Result<RestoreRequest, BackupError> {
    let window = match (&cli.from, &cli.to) {
        (Some(from), Some(to)) => SnapshotWindow::parse(from, to)?,
        _ => {
            return Err(BackupError::Config(
                "--restore needs both --from and --to".to_string(),
            ))
        }
    };

    Ok(RestoreRequest {
        tables: config.pipeline.get_tables(),
        window: Some(window),
    })
}

fn print_report(report: &RunReport, json: bool) -> Result<(), BackupError> {
    if json {
        println!("{}", report.to_json()?);
        return Ok(());
    }

    let title = match report.status {
        RunStatus::Completed => format!("{} completed!", capitalize(report.direction.as_str())),
        RunStatus::Cancelled => format!("{} cancelled", capitalize(report.direction.as_str())),
    };
    println!("\n{}", title);
    println!("  Run ID: {}", report.run_id);
    println!("  Mode: {}", report.mode);
    println!("  Duration: {:.2}s", report.duration_seconds);
    if !report.containers.is_empty() {
        println!("  Containers: {}", report.containers.len());
    }
    println!("  Tables: {}", report.tables.len());
    println!(
        "  Items: {} copied, {} skipped, {} faulted",
        report.summary.copied, report.summary.skipped, report.summary.faulted
    );
    for item in &report.faulted_items {
        println!("    {}: {}", item.source, item.diagnostic);
    }
    Ok(())
}

fn check_cancelled(report: &RunReport) -> Result<(), BackupError> {
    match report.status {
        RunStatus::Cancelled => Err(BackupError::Cancelled),
        RunStatus::Completed => Ok(()),
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so --output-json stays parseable
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Cancel the returned token on SIGINT or SIGTERM.
#[cfg(unix)]
fn setup_signal_handler() -> Result<CancellationToken, BackupError> {
    let cancel_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token = cancel_token.clone();
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!("\nReceived {}. Finishing in-flight items...", name);
        token.cancel();
    });

    Ok(cancel_token)
}

/// Cancel the returned token on Ctrl-C.
#[cfg(not(unix))]
fn setup_signal_handler() -> Result<CancellationToken, BackupError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Finishing in-flight items...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
