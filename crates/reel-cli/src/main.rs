use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use reel_sync::{Pipeline, PipelineConfig, StageSummary};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "reel-cli")]
#[command(about = "Resolve catalog titles to reference ids and enrich them")]
struct Cli {
    /// YAML config file; `REEL_*` environment variables are used when absent.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search each catalog title and record its external id.
    Resolve,
    /// Fetch detail pages for every resolved record.
    Enrich,
    /// Resolve, then enrich.
    Run,
    /// Show checkpoint progress without fetching.
    Status,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn print_summary(summary: &StageSummary) {
    println!(
        "{} complete: run_id={} attempted={} succeeded={} unresolved={} degraded={} skipped={}",
        summary.stage,
        summary.run_id,
        summary.attempted,
        summary.succeeded,
        summary.unresolved,
        summary.degraded,
        summary.skipped
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)?,
        None => PipelineConfig::from_env(),
    };
    tracing::debug!(?config, "configuration loaded");
    let pipeline = Pipeline::new(config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Resolve => print_summary(&pipeline.run_resolution().await?),
        Commands::Enrich => print_summary(&pipeline.run_enrichment().await?),
        Commands::Run => {
            for summary in pipeline.run_all().await? {
                print_summary(&summary);
            }
        }
        Commands::Status => {
            let status = pipeline.status().await?;
            println!(
                "catalog={} resolution_entries={} resolved={} unresolved={} enriched={}",
                status.catalog_records,
                status.resolution_entries,
                status.resolved,
                status.unresolved,
                status.enriched
            );
        }
    }

    Ok(())
}
