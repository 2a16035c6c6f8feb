//! tablecopy CLI - parallel batched table migration between databases.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tablecopy::{CopyConfig, CopyError, MigrationService};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tablecopy")]
#[command(about = "Parallel batched table migration between databases")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Output final status as JSON to stdout
    #[arg(long)]
    output_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new migration and wait for it to finish
    Run,

    /// Resume an unfinished migration
    Resume {
        /// Migration run id to resume
        migration_id: String,
    },

    /// Print the status of a migration run
    Status {
        /// Migration run id
        migration_id: String,
    },

    /// Abort a running migration
    Abort {
        /// Migration run id
        migration_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tablecopy={}", cli.verbosity)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CopyError> {
    let config = CopyConfig::from_file(&cli.config)?.with_auto_tuning();
    let service = MigrationService::connect(config).await?;

    match cli.command {
        Commands::Run => {
            let ctx = service.start_migration().await?;
            info!("Migration run {} started", ctx.migration_id);
            service.copy_local(&ctx).await?;
            let status = service.wait_for_finish(&ctx).await?;
            info!(
                "Migration {}: {}/{} tasks completed, {} failed",
                status.migration_id,
                status.completed_tasks,
                status.total_tasks,
                status.failed_tasks
            );
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            Ok(())
        }
        Commands::Resume { migration_id } => {
            let ctx = service.resume_migration(&migration_id).await?;
            service.copy_local(&ctx).await?;
            let status = service.wait_for_finish(&ctx).await?;
            info!(
                "Migration {} resumed: {}/{} tasks completed",
                status.migration_id, status.completed_tasks, status.total_tasks
            );
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            }
            Ok(())
        }
        Commands::Status { migration_id } => {
            let ctx = service.resume_context(&migration_id).await?;
            let status = service.migration_state(&ctx).await?;
            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                info!(
                    "Migration {}: {:?}, {}/{} tasks completed, {} failed",
                    status.migration_id,
                    status.status,
                    status.completed_tasks,
                    status.total_tasks,
                    status.failed_tasks
                );
            }
            Ok(())
        }
        Commands::Abort { migration_id } => {
            let ctx = service.resume_context(&migration_id).await?;
            service.stop_migration(&ctx).await?;
            info!("Migration {} aborted", migration_id);
            Ok(())
        }
    }
}
