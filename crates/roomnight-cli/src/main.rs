//! `roomnight`: seed the hotel warehouse and drive the transformation
//! pipeline.
//!
//! # Usage
//!
//! ```
//! roomnight seed --reset
//! roomnight run fct_booking
//! roomnight status
//! roomnight show rpt_hotel_daily_kpis --limit 10
//! ```

mod commands;
mod settings;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

#[derive(Parser, Debug)]
#[command(name = "roomnight", version, about = "Hotel analytics seed loader and pipeline runner")]
struct Cli {
  /// Path to a TOML config file (default: roomnight.toml if present).
  #[arg(short, long, value_name = "FILE", global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load the seed dataset into the raw tables.
  Seed {
    /// Empty every raw table first and restart identities.
    #[arg(long)]
    reset:   bool,
    /// JSON dataset to load instead of the bundled demo data.
    #[arg(long, value_name = "FILE")]
    dataset: Option<PathBuf>,
  },
  /// List pipeline steps in dependency order.
  Steps,
  /// Run the named steps and their upstream dependencies (all steps if none).
  Run {
    steps:  Vec<String>,
    /// Skip steps that succeeded in the most recent recorded run.
    #[arg(long)]
    resume: bool,
  },
  /// Show per-step outcomes of the most recent run.
  Status,
  /// Print rows of a relation as JSON lines.
  Show {
    relation: String,
    #[arg(long, default_value_t = 20)]
    limit:    usize,
  },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let settings = Settings::load(cli.config)?;

  match cli.command {
    Command::Seed { reset, dataset } => commands::seed(&settings, reset, dataset).await,
    Command::Steps => commands::steps(&settings),
    Command::Run { steps, resume } => commands::run(&settings, &steps, resume).await,
    Command::Status => commands::status(&settings).await,
    Command::Show { relation, limit } => commands::show(&settings, &relation, limit).await,
  }
}
