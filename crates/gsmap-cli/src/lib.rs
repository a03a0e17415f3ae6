pub mod simulate;
pub mod ui;

use std::path::PathBuf;

use burn::config::Config;
use clap::{error::ErrorKind, Args, Error, Parser, Subcommand};
use gsmap_train::TrainConfig;

use crate::simulate::SceneConfig;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "gsmap - adaptive density control for online Gaussian mapping"
)]
pub struct Cli {
    /// Print tracing spans and their timings to stderr.
    #[arg(long, global = true)]
    pub trace: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Map a synthetic sphere and report densify and prune activity.
    Simulate(SimulateArgs),
    /// Print the default training configuration as JSON.
    PrintConfig,
}

#[derive(Args)]
pub struct SimulateArgs {
    /// Load the training configuration from this JSON file. Training flags are ignored.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[clap(flatten)]
    pub scene: SceneConfig,

    #[clap(flatten)]
    pub train: TrainConfig,
}

impl SimulateArgs {
    /// The configuration to train with: the file if one was given, the flags otherwise.
    pub fn train_config(&self) -> anyhow::Result<TrainConfig> {
        match &self.config {
            Some(path) => {
                let config = TrainConfig::load(path)
                    .map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", path.display()))?;
                log::info!("Loaded training config from {}", path.display());
                Ok(config)
            }
            None => Ok(self.train.clone()),
        }
    }
}

impl Cli {
    pub fn validate(self) -> Result<Self, Error> {
        if let Command::Simulate(args) = &self.command {
            if args.scene.num_points == 0 {
                return Err(Error::raw(
                    ErrorKind::ValueValidation,
                    "--num-points must be at least 1",
                ));
            }
            if args.train.densify.num_to_split_into == 0 {
                return Err(Error::raw(
                    ErrorKind::ValueValidation,
                    "--num-to-split-into must be at least 1",
                ));
            }
        }
        Ok(self)
    }
}
