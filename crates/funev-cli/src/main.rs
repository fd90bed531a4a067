use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use funev_ingest::{build_scheduler, IngestConfig, IngestPipeline};
use funev_storage::{EventStore, PgStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "funev-cli")]
#[command(about = "Fun Events open-data aggregator command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over the enabled sources.
    Ingest,
    /// Run the cron scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();
    let store: Arc<dyn EventStore> = Arc::new(PgStore::connect(&config.database_url).await?);
    let pipeline = Arc::new(IngestPipeline::new(config, store)?);

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = pipeline.run_once().await?;
            println!(
                "pass {} finished: {} committed, {} failed",
                summary.pass_id,
                summary.committed_count(),
                summary.failed_count()
            );
            for source in &summary.sources {
                match &source.error {
                    None => println!(
                        "  {}: {:?} created={} updated={} unchanged={} skipped={}",
                        source.source_id,
                        source.state,
                        source.created,
                        source.updated,
                        source.unchanged,
                        source.skipped
                    ),
                    Some(error) => println!("  {}: {:?} ({error})", source.source_id, source.state),
                }
            }
        }
        Commands::Schedule => match build_scheduler(pipeline.clone()).await? {
            Some(sched) => {
                sched.start().await?;
                println!("scheduler running; press ctrl-c to stop");
                tokio::signal::ctrl_c().await?;
            }
            None => eprintln!("scheduler disabled; set FUNEV_SCHEDULER_ENABLED=1"),
        },
    }

    Ok(())
}
