use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opinion_etl::{EtlConfig, EtlPipeline, SentimentClassifier};
use opinion_store::PgWarehouse;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opinion-cli")]
#[command(about = "Opinion analytics warehouse loader")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ETL once and print the run summary as JSON.
    Run {
        /// Apply the warehouse schema before running.
        #[arg(long)]
        migrate: bool,
    },
    /// Run the ETL on its interval until interrupted.
    Schedule {
        #[arg(long)]
        migrate: bool,
    },
    /// Create the star-schema tables if they do not exist.
    Migrate,
    /// Classify a comment with the lexicon used for social comments.
    Classify { text: String },
}

async fn migrate(config: &EtlConfig) -> Result<()> {
    let warehouse = PgWarehouse::connect(&config.warehouse_url, config.batch_size)
        .await
        .context("connecting to warehouse")?;
    warehouse.migrate().await.context("applying warehouse schema")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, stopping"),
            Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
        }
        token.cancel();
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let config = EtlConfig::from_env();

    match cli.command.unwrap_or(Commands::Run { migrate: false }) {
        Commands::Run { migrate: apply } => {
            if apply {
                migrate(&config).await?;
            }
            config.validate()?;
            let cancel = cancel_on_ctrl_c();
            let pipeline = EtlPipeline::from_config(config).await?;
            let summary = pipeline.run_once(&cancel).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing run summary")?
            );
        }
        Commands::Schedule { migrate: apply } => {
            if apply {
                migrate(&config).await?;
            }
            let cancel = cancel_on_ctrl_c();
            let pipeline = EtlPipeline::from_config(config).await?;
            pipeline.run_scheduled(&cancel).await?;
        }
        Commands::Migrate => migrate(&config).await?,
        Commands::Classify { text } => {
            let classifier = SentimentClassifier::new();
            let score = classifier.score(&text);
            println!(
                "{} (positive={}, negative={})",
                score.label(),
                score.positive,
                score.negative
            );
        }
    }

    Ok(())
}
