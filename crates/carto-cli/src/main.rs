use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use carto_core::{combinations_for, CollectionStrategy};
use carto_pipeline::{
    clean_all, consolidate, CancelFlag, Collector, RunConfig, RunController, RunStateHandle,
};
use carto_web::AppState;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "carto-cli")]
#[command(about = "ScanSante MCO activity collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run a full collection in the foreground, then clean and consolidate.
    Collect {
        /// Seconds to wait between requests.
        #[arg(long)]
        delay_secs: Option<u64>,
        /// Restrict the run to the national parameter space.
        #[arg(long)]
        national_only: bool,
    },
    /// Re-clean the raw artifacts already on disk.
    Clean,
    /// Rebuild the master dataset from the cleaned artifacts.
    Consolidate,
    /// Serve the dashboard JSON API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = RunConfig::from_env();

    match cli.command.unwrap_or(Commands::Collect {
        delay_secs: None,
        national_only: false,
    }) {
        Commands::Collect {
            delay_secs,
            national_only,
        } => {
            let strategy = if national_only {
                CollectionStrategy::NationalOnly
            } else {
                CollectionStrategy::Full
            };
            let delay = delay_secs.map(Duration::from_secs).unwrap_or(config.delay);
            let combinations = combinations_for(strategy);

            let state = RunStateHandle::default();
            let cancel = CancelFlag::default();
            if !state.try_begin(combinations.len()) {
                anyhow::bail!("a collection run is already in progress");
            }
            let controller = RunController::new(&config, state, cancel)?;
            let summary = controller.run(&combinations, delay).await;
            println!(
                "collection complete: {} processed, {} ok, {} empty, {} minimal, {} failed, {} skipped",
                summary.processed,
                summary.succeeded,
                summary.empty_zones,
                summary.minimal_data,
                summary.failed,
                summary.skipped
            );

            let layout = config.layout();
            let clean = clean_all(&layout.raw_dir(), &layout.cleaned_dir())?;
            println!(
                "cleaning complete: {} files cleaned, {} failed, {} rows",
                clean.cleaned, clean.failed, clean.total_rows
            );
            let master = consolidate(&layout.cleaned_dir(), &layout.master_path())?;
            println!(
                "master dataset written: {} rows from {} files -> {}",
                master.rows,
                master.files,
                layout.master_path().display()
            );
        }
        Commands::Clean => {
            let layout = config.layout();
            let summary = clean_all(&layout.raw_dir(), &layout.cleaned_dir())?;
            println!(
                "cleaning complete: {} files cleaned, {} failed, {} rows",
                summary.cleaned, summary.failed, summary.total_rows
            );
        }
        Commands::Consolidate => {
            let layout = config.layout();
            let summary = consolidate(&layout.cleaned_dir(), &layout.master_path())?;
            println!(
                "master dataset written: {} rows from {} files -> {}",
                summary.rows,
                summary.files,
                layout.master_path().display()
            );
        }
        Commands::Serve { port } => {
            let collector = Arc::new(Collector::new(config));
            carto_web::serve(AppState::new(collector), port).await?;
        }
    }

    Ok(())
}
