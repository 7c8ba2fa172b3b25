mod agent;
mod bridge;
mod config;
mod datadir;
mod db;
mod ingest;
mod lockfile;
mod memory;
mod query;
mod scheduler;
mod server;
mod tags;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use config::Settings;

#[derive(Parser)]
#[command(name = "mnemo", version, about = "Local-first coding-session memory worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the worker (loopback HTTP + SSE)
    Serve,
    /// Start the search bridge (stdio MCP; auto-starts the worker)
    Bridge,
    /// Replay transcript files into the worker
    Ingest {
        /// Transcript root or a single .jsonl file
        #[arg(long)]
        path: Option<PathBuf>,
        /// Workspace used when records carry no cwd
        #[arg(long)]
        workspace: Option<String>,
        /// Also ingest system/warning lines
        #[arg(long)]
        include_system: bool,
        /// Only records with ts >= this epoch value
        #[arg(long)]
        since_ts: Option<i64>,
        /// Cap the number of records across the run
        #[arg(long)]
        limit: Option<usize>,
        /// Do not request per-session summaries
        #[arg(long)]
        skip_summaries: bool,
    },
    /// Copy the legacy data directory to the canonical location (one-shot)
    MigrateData {
        /// Print the plan without creating the destination
        #[arg(long)]
        dry_run: bool,
        /// Overwrite existing destination files and ignore the lock
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The bridge owns stdout for JSON-RPC framing; everything it logs must
    // go to stderr, installed before any other initialization can log.
    let filter =
        EnvFilter::try_from_env("MNEMO_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    match cli.command {
        Command::Bridge => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();

            let settings = Settings::load_from(&Settings::settings_path(
                &config::default_data_dir(),
            ))?;
            bridge::serve_stdio(&settings).await?;
        }
        Command::Serve => {
            let settings = Settings::load_from(&Settings::settings_path(
                &config::default_data_dir(),
            ))?;

            // Daily log files under <data_dir>/logs, plus stderr.
            let log_dir = settings.data_dir.join("logs");
            std::fs::create_dir_all(&log_dir)?;
            let file_appender = tracing_appender::rolling::Builder::new()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("mnemo")
                .filename_suffix("log")
                .build(&log_dir)?;
            let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_writer.and(std::io::stderr))
                .with_ansi(false)
                .init();

            server::serve(settings).await?;
        }
        Command::Ingest {
            path,
            workspace,
            include_system,
            since_ts,
            limit,
            skip_summaries,
        } => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();

            let settings = Settings::load_from(&Settings::settings_path(
                &config::default_data_dir(),
            ))?;

            let options = ingest::IngestOptions {
                worker_url: format!(
                    "http://{}:{}",
                    settings.worker_host, settings.worker_port
                ),
                workspace,
                include_system,
                since_ts,
                limit,
                skip_summaries,
                retry: ingest::retry::RetryPolicy::default(),
            };

            let state_path = ingest::checkpoint::checkpoint_path(&settings.data_dir);
            let mut engine = ingest::IngestionEngine::new(options, state_path)?;

            let root = path.unwrap_or_else(|| {
                dirs::home_dir()
                    .expect("home directory must exist")
                    .join(".codex")
                    .join("sessions")
            });
            let report = if root.is_file() {
                engine.run_files(&[root]).await?
            } else {
                engine.run_root(&root).await?
            };

            println!(
                "ingested {} record(s) from {} file(s); {} session(s), {} summar(ies)",
                report.records_posted,
                report.files_processed,
                report.sessions_initialized,
                report.summaries_requested
            );
        }
        Command::MigrateData { dry_run, force } => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();

            let outcome = datadir::migrate_data_dir(
                &config::legacy_data_dir(),
                &config::default_data_dir(),
                dry_run,
                force,
            )?;
            match outcome {
                datadir::MigrationOutcome::NotNeeded => println!("nothing to migrate"),
                datadir::MigrationOutcome::AlreadyDone => println!("already migrated"),
                datadir::MigrationOutcome::Planned(n) => println!("{n} file(s) in plan"),
                datadir::MigrationOutcome::Migrated(n) => println!("migrated {n} file(s)"),
            }
        }
    }

    Ok(())
}
