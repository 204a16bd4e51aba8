//! sitepack - main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sitepack::archive::{ExtractOptions, Strip, ZipReader};
use sitepack::job::{BackupMachine, JobId, TickReport};
use sitepack::utils::shutdown::ShutdownCoordinator;
use sitepack::{api, utils, Config};
use std::net::SocketAddr;
use std::path::PathBuf;

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
    /// Start a fresh backup job
    Start {
        job_id: String,

        /// Site-relative tree to leave out of the archive (repeatable)
        #[arg(long, value_name = "PATH")]
        inactive: Vec<String>,
    },

    /// Run one tick of a job
    Resume { job_id: String },

    /// Start a job and tick it until the archive is complete
    Run { job_id: String },

    /// Write a completed archive to a file, then clean the job up
    Fetch {
        job_id: String,

        #[arg(short, long, value_name = "FILE")]
        output: PathBuf,
    },

    /// Remove a job's working tree and files
    Cleanup { job_id: String },

    /// List the entries of a ZIP archive
    List { archive: PathBuf },

    /// Extract a ZIP archive
    Extract {
        archive: PathBuf,
        output: PathBuf,

        /// Drop this many leading path segments
        #[arg(long, conflicts_with = "strip_prefix")]
        strip: Option<usize>,

        /// Remove this literal prefix from entry paths
        #[arg(long)]
        strip_prefix: Option<String>,

        /// Only extract paths matching this regex
        #[arg(long)]
        include: Option<String>,

        /// Skip paths matching this regex
        #[arg(long)]
        exclude: Option<String>,
    },

    /// Serve the HTTP job endpoints
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    match args.command {
        Command::Serve { port } => serve(config, port).await,
        Command::List { archive } => list(archive),
        Command::Extract {
            archive,
            output,
            strip,
            strip_prefix,
            include,
            exclude,
        } => {
            let strip = match (strip, strip_prefix) {
                (Some(count), _) => Strip::Components(count),
                (None, Some(prefix)) => Strip::Prefix(prefix),
                (None, None) => Strip::None,
            };
            let options = ExtractOptions::new(strip, include.as_deref(), exclude.as_deref())?;
            let extracted = ZipReader::open(&archive)?.extract(&output, &options)?;
            println!("Extracted {} entries into {}", extracted.len(), output.display());
            Ok(())
        }
        command => tokio::task::spawn_blocking(move || run_job_command(&config, command)).await?,
    }
}

fn run_job_command(config: &Config, command: Command) -> Result<()> {
    let machine = BackupMachine::from_config(config)?;

    match command {
        Command::Start { job_id, inactive } => {
            let ctx = machine.context(JobId::parse(&job_id)?);
            let state = machine.start(&ctx, &inactive)?;
            println!(
                "Started {}: {} paths, {} tables queued",
                ctx.id,
                state.pending_files.len(),
                state.pending_tables.len()
            );
        }
        Command::Resume { job_id } => {
            let ctx = machine.context(JobId::parse(&job_id)?);
            print_report(&machine.resume(&ctx)?);
        }
        Command::Run { job_id } => {
            let ctx = machine.context(JobId::parse(&job_id)?);
            machine.start(&ctx, &[])?;
            loop {
                let report = machine.resume(&ctx)?;
                print_report(&report);
                if report.complete {
                    println!("Archive: {}", ctx.paths.archive.display());
                    break;
                }
            }
        }
        Command::Fetch { job_id, output } => {
            let ctx = machine.context(JobId::parse(&job_id)?);
            let bytes = machine.fetch(&ctx)?;
            std::fs::write(&output, &bytes)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {} bytes to {}", bytes.len(), output.display());
        }
        Command::Cleanup { job_id } => {
            let ctx = machine.context(JobId::parse(&job_id)?);
            machine.cleanup(&ctx)?;
        }
        Command::List { .. } | Command::Extract { .. } | Command::Serve { .. } => {}
    }
    Ok(())
}

fn print_report(report: &TickReport) {
    println!(
        "{}: phase {}, {} batches, {} processed, {} remaining{}",
        report.job_id,
        report.phase,
        report.batches,
        report.processed,
        report.remaining,
        if report.complete { " (complete)" } else { "" }
    );
}

fn list(archive: PathBuf) -> Result<()> {
    for entry in ZipReader::open(&archive)?.list_entries()? {
        println!(
            "{:>10} {:>10} {} {}{}",
            entry.size,
            entry.compressed_size,
            entry.modified.format("%Y-%m-%d %H:%M:%S"),
            entry.path(),
            if entry.is_dir() { "/" } else { "" }
        );
    }
    Ok(())
}

async fn serve(config: Config, port: Option<u16>) -> Result<()> {
    api::health::init_start_time();

    tracing::info!("Starting sitepack v{}", env!("CARGO_PKG_VERSION"));
    if config.agent.token.is_empty() {
        tracing::warn!("No token configured, every job request will be rejected");
    }

    let port = port.unwrap_or(config.agent.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = api::create_router(api::create_app_state(config));

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = ShutdownCoordinator::new();
    let mut stopped = shutdown.subscribe();

    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        stopped.recv().await.ok();
    });
    let server_handle = tokio::spawn(async move { server.await });

    shutdown.wait_for_signal().await;

    match tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}
