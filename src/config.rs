//! Command-line input parameters for training and ensemble prediction

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::training::TrainingConfig;

/// How [`PredictParams`] are populated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterMode {
    /// Every parameter at its default value
    Default,
    /// Parsed from the process arguments
    Args,
}

impl FromStr for ParameterMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "args" => Ok(Self::Args),
            other => Err(Error::not_implemented(format!("Unknown parameter mode {}", other))),
        }
    }
}

/// Input parameters of an ensemble prediction run
#[derive(Parser, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictParams {
    /// Directories holding the images to classify
    #[arg(
        long = "test-path",
        alias = "test_path",
        num_args = 1..,
        default_values = ["./data/"],
        help = "Directories holding the images to classify"
    )]
    pub test_path: Vec<PathBuf>,

    /// Directory of a training run: `params.json` plus one sub-directory per init
    #[arg(
        long = "main-model-path",
        alias = "main_model_path",
        default_value = "./out/trained_models/",
        help = "Directory holding params.json and the trained inits"
    )]
    pub main_model_path: PathBuf,

    /// Where `predictions.json` is written
    #[arg(long, default_value = "./out/", help = "Output directory")]
    pub outpath: PathBuf,

    /// Run names of the ensemble members
    #[arg(
        long = "init-names",
        alias = "init_names",
        num_args = 1..,
        default_values = ["Init_0", "Init_1"],
        help = "Names of the trained inits to ensemble"
    )]
    pub init_names: Vec<String>,
}

impl Default for PredictParams {
    fn default() -> Self {
        Self::parse_from(["predict"])
    }
}

impl PredictParams {
    /// Build parameters in the given mode from the process arguments
    ///
    /// `Args` expects a process whose arguments are only these flags. The
    /// `plankton predict` subcommand parses them itself.
    pub fn from_mode(mode: ParameterMode) -> Result<Self> {
        Self::from_mode_with_args(mode, std::env::args_os())
    }

    /// Build parameters in the given mode; `args` is read only in `Args` mode
    pub fn from_mode_with_args<I, T>(mode: ParameterMode, args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let params = match mode {
            ParameterMode::Default => Self::default(),
            ParameterMode::Args => Self::from_args(args)?,
        };
        debug!("{:?}", params);
        Ok(params)
    }

    /// Parse from an explicit argument list (first item is the program name)
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(args).map_err(|e| Error::config(e.to_string()))
    }

    /// Create the output directory
    pub fn create_out_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.outpath)?;
        info!("Output directory {:?}", self.outpath);
        Ok(())
    }
}

/// Command-line overrides applied on top of a layered [`TrainingConfig`]
#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct TrainOverrides {
    /// Number of training epochs
    #[arg(short, long, help = "Number of training epochs")]
    pub epochs: Option<usize>,

    /// Base learning rate
    #[arg(long = "lr", help = "Override learning rate")]
    pub learning_rate: Option<f64>,

    /// Training batch size
    #[arg(short, long, help = "Training batch size")]
    pub batch_size: Option<usize>,

    /// Seed for splits, shuffling and augmentation
    #[arg(long, help = "Random seed")]
    pub seed: Option<u64>,

    /// Data loader worker threads
    #[arg(long, help = "Number of data loader workers")]
    pub num_workers: Option<usize>,
}

impl TrainOverrides {
    /// Apply the overrides and re-validate
    pub fn apply(&self, config: &mut TrainingConfig) -> anyhow::Result<()> {
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(lr) = self.learning_rate {
            config.optimizer.learning_rate = lr;
        }
        if let Some(batch_size) = self.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(seed) = self.seed {
            config.training.seed = seed;
        }
        if let Some(num_workers) = self.num_workers {
            config.training.num_workers = num_workers;
        }
        config.validate()
    }
}
