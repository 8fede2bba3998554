//! Inference with a trained urban/rural classifier
//!
//! - Single image, file and directory prediction
//! - Labelled evaluation of a `<dir>/<class>/*` folder

pub mod predictor;

pub use predictor::{evaluate_dir, PredictionResult, Predictor};

/// Images per forward pass when predicting a directory
pub const DEFAULT_BATCH_SIZE: usize = 16;
