//! # Urban/Rural Transfer Learning
//!
//! Classifies scene photos as urban or rural by training a small linear head
//! on top of a frozen, pretrained convolutional feature extractor, using the
//! Burn framework.
//!
//! ## Features
//!
//! - **Frozen backbone**: a pretrained ONNX export (ResNet50, Xception) run
//!   with ONNX Runtime, or a Burn record; never updated
//! - **Linear head**: the only trainable parameters, trained with SGD or Adam
//! - **Image folders**: one directory per class, labels from sorted names
//! - **Augmentation**: seeded random flips and shifts during training
//! - **Feature cache**: backbone embeddings reused across epochs when
//!   nothing is augmented
//!
//! ## Modules
//!
//! - `dataset`: folder discovery, preprocessing, augmentation, Burn batching
//! - `model`: feature extractor, classification head, combined classifier
//! - `training`: head-only training loop, checkpoints, full pipeline
//! - `inference`: prediction and labelled evaluation
//! - `config`: TOML experiment configuration
//! - `utils`: errors, logging and metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use urban_rural_transfer::backend::{default_device, TrainingBackend};
//! use urban_rural_transfer::config::ExperimentConfig;
//! use urban_rural_transfer::training::run_training;
//!
//! let config = ExperimentConfig::load("experiment.toml".as_ref())?;
//! let report = run_training::<TrainingBackend>(&config, &default_device())?;
//! println!("best validation accuracy: {:?}", report.summary.best_val_accuracy);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

pub use config::ExperimentConfig;
pub use dataset::{ImageFolderDataset, CLASS_NAMES};
pub use inference::{PredictionResult, Predictor};
pub use model::{BackboneKind, ClassifierHead, FeatureExtractor, TransferClassifier, TransferModelConfig};
pub use training::{run_training, Trainer, TrainingConfig, TrainingState};
pub use utils::error::{Result, TransferError};
pub use utils::metrics::{ConfusionMatrix, Metrics};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
