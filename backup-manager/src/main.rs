//! Backup Manager - Main entry point

use anyhow::Result;
use backup_manager::catalog;
use backup_manager::daemon::shutdown::ShutdownCoordinator;
use backup_manager::process::SystemRunner;
use backup_manager::report::Reporter;
use backup_manager::scheduler::BackupScheduler;
use backup_manager::transfer::progress::{format_bytes, format_duration};
use backup_manager::utils;
use backup_manager::{
    BackupExecutor, BackupOptions, Config, RestoreOrchestrator, RestoreRequest, RunOutcome,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

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
    /// Run one backup now
    Backup {
        /// Database and upload tree
        #[arg(long)]
        full: bool,

        /// Include the upload tree even when it is not scheduled today
        #[arg(long)]
        files: bool,

        /// Log the report instead of delivering it
        #[arg(long)]
        dry_run: bool,
    },
    /// Restore a recorded run
    Restore {
        /// Run id (directory name) or "latest"
        run_id: String,

        /// Restore the database dump
        #[arg(long)]
        database: bool,

        /// Restore the upload tree
        #[arg(long)]
        files: bool,
    },
    /// List recorded runs, newest first
    List,
    /// Run backups on the configured cron schedule until interrupted
    Schedule,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Command::Backup { dry_run: true, .. } = args.command {
        config.report.dry_run = true;
    }

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, Some(&config.log_path()))?;

    tracing::info!(
        "backup-manager v{} (root: {})",
        env!("CARGO_PKG_VERSION"),
        config.backup.root.display()
    );

    match args.command {
        Command::Backup { full, files, .. } => {
            let reporter = Reporter::from_config(&config.report);
            let executor = BackupExecutor::new(config, Arc::new(SystemRunner), reporter);
            let outcome = executor.execute(BackupOptions { full, files }).await?;
            if outcome == RunOutcome::AlreadyRunning {
                tracing::info!("Backup already running, nothing to do");
            }
            Ok(exit_code(outcome.success()))
        }
        Command::Restore {
            run_id,
            database,
            files,
        } => {
            let request = RestoreRequest::new(run_id, database, files);
            let orchestrator = RestoreOrchestrator::new(config, Arc::new(SystemRunner));
            let summary = orchestrator.restore(&request).await?;
            if let Some(path) = &summary.safety_path {
                println!("Previous upload tree kept at {}", path.display());
            }
            println!(
                "Restored run {} (database: {}, files: {})",
                summary.run_id, summary.database_restored, summary.files_restored
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            let runs = catalog::list_runs(&config.backup.root)?;
            if runs.is_empty() {
                println!("No backups under {}", config.backup.root.display());
            }
            for run in runs {
                let meta = &run.manifest.metadata;
                println!(
                    "{}  {:<5}  {:>10}  {:>8}  {}",
                    run.run_id,
                    meta.run_type,
                    format_bytes(meta.total_size),
                    format_duration(meta.duration.round() as u64),
                    if meta.errors.is_empty() {
                        "ok".to_string()
                    } else {
                        format!("{} error(s)", meta.errors.len())
                    }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Schedule => {
            let cron = config.schedule.cron.clone();
            let reporter = Reporter::from_config(&config.report);
            let executor = Arc::new(BackupExecutor::new(config, Arc::new(SystemRunner), reporter));

            let scheduler = BackupScheduler::new(executor).await?;
            scheduler.schedule(&cron).await?;
            scheduler.start().await?;
            tracing::info!(cron = %cron, "Scheduler running");

            let shutdown = ShutdownCoordinator::new();
            shutdown.wait_for_signal().await;

            scheduler.shutdown().await?;
            tracing::info!("Scheduler stopped");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
