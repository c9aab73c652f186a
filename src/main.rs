use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use plankton::config::{ParameterMode, PredictParams, TrainOverrides};
use plankton::logging::init_logging;
use plankton::model::{ModelArchitecture, PretrainedSource};
use plankton::predict::run_prediction;
use plankton::training::{Trainer, TrainingConfig};
use plankton::utils::device::select_device;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "plankton")]
#[command(about = "Plankton image classification: ViT fine-tuning and ensemble prediction", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train one ensemble member on an image folder
    Train(TrainCommand),

    /// Classify images with an ensemble of trained members
    Predict(PredictCommand),

    /// Validate a training configuration file
    Config {
        /// Configuration file to validate (JSON or YAML)
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

#[derive(Args)]
struct TrainCommand {
    /// Image folder with one sub-directory per class
    #[arg(short, long, help = "Path to the labelled image folder")]
    data: PathBuf,

    /// Output directory for params.json and run directories
    #[arg(short, long, default_value = "./out/", help = "Output directory")]
    outpath: PathBuf,

    /// Training configuration file (JSON or YAML)
    #[arg(short, long, help = "Training configuration file")]
    config: Option<PathBuf>,

    /// Name of this run, used as the checkpoint sub-directory
    #[arg(long, default_value = "Init_0", help = "Run (init) name")]
    run_name: String,

    #[command(flatten)]
    overrides: TrainOverrides,

    /// Force CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct PredictCommand {
    /// `args` uses the flags below, `default` ignores them
    #[arg(long, default_value = "args", help = "Parameter mode (default|args)")]
    params_mode: String,

    #[command(flatten)]
    params: PredictParams,

    /// Force CPU even when CUDA is available
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.json_logs)?;

    match cli.command {
        Commands::Train(command) => train(command)?,
        Commands::Predict(command) => predict(command)?,
        Commands::Config { file } => validate_config(file)?,
        Commands::Info => show_system_info(),
    }

    Ok(())
}

fn train(command: TrainCommand) -> Result<()> {
    info!("Running training for run '{}'", command.run_name);

    let mut config = TrainingConfig::load_layered(command.config.as_deref())
        .context("Failed to load training configuration")?;
    command.overrides.apply(&mut config)?;

    let device = select_device(command.cpu);
    let mut trainer = Trainer::new(config, &command.outpath, command.run_name, device)?;
    let result = trainer.run_from_folder(&command.data)?;

    info!(
        "Finished {} epochs in {:.2} minutes ({:?})",
        result.history.len(),
        result.training_duration.as_secs_f64() / 60.0,
        result.final_state.status
    );
    match &result.best_checkpoint_path {
        Some(path) => info!("Best checkpoint: {}", path.display()),
        None => warn!("Validation F1 never rose above zero; no checkpoint was written"),
    }
    if let Some(test) = &result.test_summary {
        info!(
            "Test split: {} samples, Acc:{:.3}, F1:{:.3}",
            test.num_samples, test.accuracy, test.f1
        );
    }

    Ok(())
}

fn predict(command: PredictCommand) -> Result<()> {
    let params = match command.params_mode.parse::<ParameterMode>()? {
        ParameterMode::Args => command.params,
        ParameterMode::Default => PredictParams::from_mode(ParameterMode::Default)?,
    };
    info!("model_path: {}", params.main_model_path.display());

    let device = select_device(command.cpu);
    let path = run_prediction(&params, device)?;
    info!("Predictions saved to: {}", path.display());
    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = TrainingConfig::from_file(&config_path).context("Failed to load configuration file")?;

    // from_file validates
    info!("Configuration is valid");
    info!("Configuration summary:");
    match &config.model.architecture {
        ModelArchitecture::Vit(vit) => info!(
            "  - Model: ViT ({} layers, hidden {}, patch {}) at {}px",
            vit.num_hidden_layers, vit.hidden_size, vit.patch_size, config.model.image_size
        ),
        ModelArchitecture::Linear => info!("  - Model: linear at {}px", config.model.image_size),
    }
    match &config.model.pretrained {
        Some(PretrainedSource::Hub { repo, file }) => info!("  - Pretrained: {}/{}", repo, file),
        Some(PretrainedSource::Local { path }) => info!("  - Pretrained: {}", path.display()),
        None => info!("  - Pretrained: none"),
    }
    info!(
        "  - Epochs: {}, batch size: {}, lr: {}",
        config.training.epochs, config.training.batch_size, config.optimizer.learning_rate
    );
    info!(
        "  - Warmup: {}, cosine: {}, early stopping patience: {}",
        config.schedule.warmup, !config.schedule.disable_cos, config.early_stopping.patience
    );

    Ok(())
}

fn show_system_info() {
    println!("plankton - plankton image classification");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA GPU acceleration: yes");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA GPU acceleration: not compiled");

    #[cfg(feature = "metal")]
    println!("  Metal GPU acceleration: yes");
    #[cfg(not(feature = "metal"))]
    println!("  Metal GPU acceleration: not compiled");

    #[cfg(feature = "accelerate")]
    println!("  Accelerate framework: yes");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate framework: not compiled");

    println!("  CPU: yes");
    println!();
    println!("Usage:");
    println!("  plankton train --data ./data/ --outpath ./out/ --run-name Init_0");
    println!("  plankton predict --test-path ./images/ --main-model-path ./out/ --init-names Init_0 Init_1");
    println!("  plankton config -f train.yaml");
    println!("  plankton info");
}
