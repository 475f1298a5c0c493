mod config;
mod engine;
mod error;
mod ml;
mod storage;
mod tracking;
mod types;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{load_config, render_config};
use crate::engine::Pipeline;
use crate::types::HyperParams;

#[derive(Parser)]
#[command(name = "weather-pipeline")]
#[command(version = "0.1.0")]
#[command(about = "Incremental training and champion selection for the weather forecasting model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "pipeline.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the latest dataset, model and test files from object storage
    Fetch,
    /// Train a fresh base model and fit its scaler on a dataset
    Bootstrap {
        /// Training CSV
        #[arg(short, long)]
        data: PathBuf,
        #[arg(long, default_value = "24")]
        seq_len: usize,
        #[arg(long, default_value = "6")]
        horizon: usize,
        #[arg(long, default_value = "30")]
        epochs: usize,
        #[arg(long, default_value = "16")]
        batch_size: usize,
    },
    /// Fine-tune every grid configuration from the current model
    Train,
    /// Score every candidate model on one test file
    Test {
        /// Test CSV
        #[arg(short, long)]
        data: PathBuf,
        /// Case name used for the output table (e.g. case_1)
        #[arg(short, long)]
        out_name: String,
    },
    /// Score candidates on all test files, then select the champion
    Evaluate,
    /// Select the champion from an existing evaluation summary
    Select,
    /// Upload artifacts and replace the production model
    Publish,
    /// Fetch, train, evaluate and publish
    Run,
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG takes precedence over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.config)?;

    if let Commands::ShowConfig = cli.command {
        println!("{}", render_config(&config)?);
        return Ok(());
    }

    info!("Weather pipeline v0.1.0");
    let pipeline = Pipeline::new(config)?;

    match cli.command {
        Commands::Fetch => {
            pipeline.fetch().await?;
        }
        Commands::Bootstrap { data, seq_len, horizon, epochs, batch_size } => {
            let hp = HyperParams::new(seq_len, horizon, epochs, batch_size);
            let model = pipeline.bootstrap(&data, hp)?;
            info!("Lineage started from {} ({})", data.display(), hp);
            info!("Base checkpoint: {}", model.path.display());
        }
        Commands::Train => {
            let report = pipeline.train().await?;
            if report.top.is_empty() {
                warn!("No configuration produced a checkpoint");
            }
        }
        Commands::Test { data, out_name } => {
            if !data.exists() {
                return Err(anyhow!("Test data {} does not exist", data.display()));
            }
            let rows = pipeline.test_case(&data, &out_name)?;
            info!("{} models scored on {}", rows.len(), out_name);
        }
        Commands::Evaluate => {
            pipeline.evaluate().await?;
        }
        Commands::Select => {
            pipeline.select().await?;
        }
        Commands::Publish => {
            let report = pipeline.publish().await?;
            if report.failed > 0 {
                warn!("{} uploads failed", report.failed);
            }
        }
        Commands::Run => {
            pipeline.run().await?;
        }
        Commands::ShowConfig => {}
    }

    Ok(())
}
