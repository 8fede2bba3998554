//! Training the classification head on top of the frozen backbone
//!
//! - `features`: image batches to embeddings, with an optional cache
//! - `trainer`: the head-only gradient loop, evaluation and early stopping
//! - `checkpoint`: per-epoch JSON summaries and head weights
//! - `pipeline`: a complete run from an experiment config

pub mod checkpoint;
pub mod features;
pub mod pipeline;
pub mod trainer;

pub use crate::config::{EarlyStoppingConfig, OptimizerKind, TrainingConfig};
pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
pub use features::{extract_batch, BatchSource, FeatureBatch, FeatureCache};
pub use pipeline::{run_training, TrainingReport};
pub use trainer::{epoch_batches, EpochMetrics, Trainer, TrainingState, TrainingSummary};
