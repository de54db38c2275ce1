//! stack-backup - Main entry point
//!
//! `run` performs one backup cycle (normally from cron), `list` shows the
//! stored archives and `check` verifies one of them.

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use stack_backup::archive::{ArchiveStore, Manifest};
use stack_backup::report::{self, ListedArchive, StorageUsage};
use stack_backup::runner::{Runner, EXIT_FATAL, EXIT_OK, EXIT_VERIFICATION_FAILED};
use stack_backup::{shutdown, utils, verify, BackupError, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

/// How long exit waits for blocking work abandoned after a timeout or signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture every target into a new archive, verify it and apply retention
    Run,
    /// Show storage usage and stored archives, newest first
    List,
    /// Verify an archive (default: the latest)
    Check {
        /// Archive id, file name or path
        archive: Option<String>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let code = match runtime.block_on(execute(args)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FATAL
        }
    };
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    ExitCode::from(code)
}

async fn execute(args: Args) -> Result<u8> {
    dotenvy::dotenv().ok();

    let config = Config::load(args.config.as_deref())?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.file.as_deref())?;

    match args.command {
        Command::Run => run(config).await,
        Command::List => list(&config),
        Command::Check { archive } => check(&config, archive).await,
    }
}

async fn run(config: Config) -> Result<u8> {
    info!("stack-backup v{} starting run", env!("CARGO_PKG_VERSION"));
    let runner = Runner::new(config);

    tokio::select! {
        result = runner.run() => {
            let report = result.inspect_err(|e| error!("Backup run failed: {}", e))?;
            print!("{}", report::render_run(&report));
            Ok(report.exit_code())
        }
        signal = shutdown::wait_for_signal() => {
            error!("Backup run interrupted by {}; staging discarded", signal);
            Ok(EXIT_FATAL)
        }
    }
}

fn list(config: &Config) -> Result<u8> {
    let store = ArchiveStore::from_config(&config.storage);
    let archives: Vec<ListedArchive> = store
        .list()?
        .into_iter()
        .map(|stored| {
            let status = Manifest::read_from_archive(&stored.path).map(|m| m.status).ok();
            ListedArchive { stored, status }
        })
        .collect();

    let usage = StorageUsage::of(store.root());
    print!("{}", report::render_list(store.root(), usage, &archives, Utc::now()));
    Ok(EXIT_OK)
}

async fn check(config: &Config, archive: Option<String>) -> Result<u8> {
    let store = ArchiveStore::from_config(&config.storage);
    let path = store.resolve(archive.as_deref())?;

    let target = path.clone();
    match tokio::task::spawn_blocking(move || verify::verify_archive(&target)).await? {
        Ok(report) => {
            print!("{}", report::render_verification(&report));
            Ok(if report.passed() { EXIT_OK } else { EXIT_VERIFICATION_FAILED })
        }
        Err(BackupError::Verification(msg)) => {
            error!("Verification of {} failed: {}", path.display(), msg);
            println!("Archive: {}\nResult: FAIL ({})", path.display(), msg);
            Ok(EXIT_VERIFICATION_FAILED)
        }
        Err(e) => Err(e.into()),
    }
}
