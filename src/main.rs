//! Urban/Rural Transfer Learning CLI
//!
//! Entry point for training the classification head, evaluating and
//! running a trained model, and inspecting datasets and configuration.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use urban_rural_transfer::backend::{backend_name, default_device, InferenceBackend, TrainingBackend};
use urban_rural_transfer::config::{ExperimentConfig, OptimizerKind};
use urban_rural_transfer::dataset::{AugmentationConfig, ImageFolderDataset};
use urban_rural_transfer::inference::{evaluate_dir, Predictor, DEFAULT_BATCH_SIZE};
use urban_rural_transfer::model::{save_conv_backbone, BackboneKind, ConvBackboneConfig};
use urban_rural_transfer::training::run_training;
use urban_rural_transfer::utils::format_number;
use urban_rural_transfer::utils::logging::{init_logging, LogConfig};

/// Urban vs. rural scene classification by transfer learning
///
/// Trains a linear classification head on top of a frozen pretrained
/// feature extractor with the Burn framework.
#[derive(Parser, Debug)]
#[command(name = "urban_rural_transfer")]
#[command(version)]
#[command(about = "Frozen-backbone transfer learning for urban/rural images", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train the classification head
    Train {
        /// TOML experiment configuration (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Training images, one sub-directory per class
        #[arg(long)]
        train_dir: Option<PathBuf>,

        /// Validation images, same class sub-directories
        #[arg(long)]
        val_dir: Option<PathBuf>,

        /// Backbone family (resnet50, xception, compact)
        #[arg(long)]
        backbone: Option<BackboneKind>,

        /// Pretrained backbone: an .onnx export, or a .mpk record for compact
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Number of training epochs
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Batch size for training
        #[arg(short, long)]
        batch_size: Option<usize>,

        /// Learning rate
        #[arg(short, long)]
        learning_rate: Option<f64>,

        /// Optimizer (sgd, adam)
        #[arg(long)]
        optimizer: Option<OptimizerKind>,

        /// Gradient steps per epoch
        #[arg(long)]
        steps_per_epoch: Option<usize>,

        /// Augmentation preset (default, flip, none)
        #[arg(long)]
        augmentation: Option<String>,

        /// Use at most this many images per split
        #[arg(long)]
        max_samples: Option<usize>,

        /// Random seed for reproducibility
        #[arg(long)]
        seed: Option<u64>,

        /// Directory for the trained model and checkpoints
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Evaluate a trained model on a labelled image folder
    Evaluate {
        /// Directory written by `train`
        #[arg(short, long)]
        model: PathBuf,

        /// Labelled images, one sub-directory per class
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Images per forward pass
        #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,
    },

    /// Classify a single image or every image in a directory
    Predict {
        /// Directory written by `train`
        #[arg(short, long)]
        model: PathBuf,

        /// Image file or directory
        #[arg(short, long)]
        input: PathBuf,

        /// Images per forward pass
        #[arg(short, long, default_value_t = DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Write predictions as JSON to this file
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Show dataset statistics
    Stats {
        /// Image folder, one sub-directory per class
        #[arg(short, long, default_value = "data/train")]
        data_dir: PathBuf,
    },

    /// Write a randomly initialized compact backbone record (for smoke runs)
    InitBackbone {
        /// Backbone family; resnet50 and xception need --stage-filters
        #[arg(long, default_value = "compact")]
        backbone: BackboneKind,

        /// Custom stage widths, e.g. 16,32,64
        #[arg(long, value_delimiter = ',')]
        stage_filters: Option<Vec<usize>>,

        /// Output path; `.mpk` is appended
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Print the effective configuration as TOML
    ShowConfig {
        /// TOML experiment configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };

    let _ = init_logging(&log_config);

    match cli.command {
        Commands::Train {
            config,
            train_dir,
            val_dir,
            backbone,
            weights,
            epochs,
            batch_size,
            learning_rate,
            optimizer,
            steps_per_epoch,
            augmentation,
            max_samples,
            seed,
            output_dir,
        } => {
            print_banner();

            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = train_dir {
                config.data.train_dir = dir;
            }
            if let Some(dir) = val_dir {
                config.data.val_dir = Some(dir);
            }
            if let Some(kind) = backbone {
                config.model.backbone = kind;
            }
            if let Some(path) = weights {
                config.model.weights = Some(path);
            }
            if let Some(n) = epochs {
                config.training.epochs = n;
            }
            if let Some(n) = batch_size {
                config.training.batch_size = n;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            if let Some(kind) = optimizer {
                config.training.optimizer = kind;
            }
            if let Some(n) = steps_per_epoch {
                config.training.steps_per_epoch = Some(n);
            }
            if let Some(name) = augmentation {
                config.training.augmentation = AugmentationConfig::preset(&name)?;
            }
            if let Some(n) = max_samples {
                config.data.max_samples = Some(n);
            }
            if let Some(s) = seed {
                config.training.seed = s;
            }
            if let Some(dir) = output_dir {
                config.output.dir = dir;
            }
            config.validate()?;

            cmd_train(&config)?;
        }

        Commands::Evaluate {
            model,
            data_dir,
            batch_size,
        } => {
            cmd_evaluate(&model, &data_dir, batch_size)?;
        }

        Commands::Predict {
            model,
            input,
            batch_size,
            json,
        } => {
            cmd_predict(&model, &input, batch_size, json.as_deref())?;
        }

        Commands::Stats { data_dir } => {
            cmd_stats(&data_dir)?;
        }

        Commands::InitBackbone {
            backbone,
            stage_filters,
            output,
        } => {
            cmd_init_backbone(backbone, stage_filters, &output)?;
        }

        Commands::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
        }
    }

    Ok(())
}

fn print_banner() {
    println!(
        "{}",
        r#"
 ╔══════════════════════════════════════════════════════════╗
 ║   Urban / Rural Transfer Learning                        ║
 ║   Frozen backbone + linear head with Burn + Rust         ║
 ╚══════════════════════════════════════════════════════════╝
  "#
        .green()
    );
}

fn load_config(path: Option<&Path>) -> Result<ExperimentConfig> {
    match path {
        Some(path) => ExperimentConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(ExperimentConfig::default()),
    }
}

fn cmd_train(config: &ExperimentConfig) -> Result<()> {
    let training = &config.training;

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Train dir:      {}", config.data.train_dir.display());
    match &config.data.val_dir {
        Some(dir) => println!("  Val dir:        {}", dir.display()),
        None => println!("  Val dir:        (none)"),
    }
    println!("  Backbone:       {}", config.model.backbone);
    match &config.model.weights {
        Some(path) => println!("  Weights:        {}", path.display()),
        None => println!("  Weights:        {}", "random (smoke run only)".yellow()),
    }
    println!("  Epochs:         {}", training.epochs);
    println!("  Batch size:     {}", training.batch_size);
    println!("  Optimizer:      {} (lr {})", training.optimizer, training.learning_rate);
    println!("  Augmentation:   {}", if training.augmentation.is_enabled() { "on" } else { "off" });
    println!("  Backend:        {}", backend_name());
    println!();

    let report = run_training::<TrainingBackend>(config, &default_device())
        .context("training failed")?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    println!("  Epochs run:         {}", report.summary.epochs_run);
    println!("  Final train loss:   {:.4}", report.summary.final_train_loss);
    println!("  Final train acc:    {:.2}%", report.summary.final_train_accuracy * 100.0);
    if let Some(acc) = report.summary.best_val_accuracy {
        println!("  Best val acc:       {:.2}%", acc * 100.0);
    }
    if report.summary.stopped_early {
        println!("  {}", "Stopped early (no validation improvement)".yellow());
    }
    println!("  Trainable params:   {}", format_number(report.trainable_params));
    match report.frozen_params {
        Some(n) => println!("  Frozen params:      {}", format_number(n)),
        None => println!("  Frozen params:      external (ONNX)"),
    }
    println!("  Saved to:           {}", report.model_dir.display());
    println!();

    println!("{}", "Next steps:".cyan().bold());
    println!(
        "  • Evaluate: urban_rural_transfer evaluate --model {} --data-dir <dir>",
        report.model_dir.display()
    );
    println!(
        "  • Predict:  urban_rural_transfer predict --model {} --input <image>",
        report.model_dir.display()
    );

    Ok(())
}

fn cmd_evaluate(model: &Path, data_dir: &Path, batch_size: usize) -> Result<()> {
    info!("Evaluating {:?} on {:?}", model, data_dir);

    let predictor = Predictor::<InferenceBackend>::load(model, default_device())
        .with_context(|| format!("loading model from {}", model.display()))?;
    let metrics = evaluate_dir(&predictor, data_dir, batch_size)?;

    println!("{}", metrics.display());
    Ok(())
}

fn cmd_predict(model: &Path, input: &Path, batch_size: usize, json: Option<&Path>) -> Result<()> {
    if !input.exists() {
        bail!("Input path not found: {}", input.display());
    }

    let predictor = Predictor::<InferenceBackend>::load(model, default_device())
        .with_context(|| format!("loading model from {}", model.display()))?;

    let results = if input.is_dir() {
        predictor.predict_dir(input, batch_size)?
    } else {
        vec![predictor.predict_path(input)?]
    };

    println!("{}", "Predictions:".cyan().bold());
    for result in &results {
        let name = result
            .image_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let label = if result.predicted_class == 0 {
            result.class_name.green()
        } else {
            result.class_name.blue()
        };
        println!(
            "  {:<50} {:<8} {:>6.2}%  ({:.1} ms)",
            name,
            label,
            result.confidence * 100.0,
            result.inference_time_ms
        );
    }

    if let Some(path) = json {
        std::fs::write(path, serde_json::to_string_pretty(&results)?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!();
        println!("  Saved {} predictions to {}", results.len(), path.display());
    }

    Ok(())
}

fn cmd_stats(data_dir: &Path) -> Result<()> {
    info!("Computing dataset statistics for: {:?}", data_dir);

    let dataset = ImageFolderDataset::new(data_dir)
        .with_context(|| format!("reading image folder {}", data_dir.display()))?;
    let stats = dataset.get_stats();

    println!("{} {}", "Image folder:".cyan().bold(), dataset.root_dir.display());
    stats.print();
    println!();
    println!("  Imbalance ratio: {:.2}", stats.imbalance_ratio());

    Ok(())
}

fn cmd_init_backbone(kind: BackboneKind, stage_filters: Option<Vec<usize>>, output: &Path) -> Result<()> {
    let config = match stage_filters {
        Some(stages) => ConvBackboneConfig::new(stages),
        None if kind.is_exported() => bail!(
            "{} weights come from an ONNX export; pass --stage-filters for a random record backbone",
            kind
        ),
        None => ConvBackboneConfig::compact(),
    };
    config.validate()?;
    let backbone = config.init::<InferenceBackend>(&default_device());
    let path = save_conv_backbone(&backbone, output)?;

    println!(
        "{} Wrote randomly initialized backbone {:?} ({}-d features) to {}",
        "Note:".yellow(),
        config.stage_filters,
        config.feature_dim(),
        path.display()
    );
    println!("  These weights are not pretrained; use them only to exercise the pipeline.");
    Ok(())
}
