//! Error type for the library.
//!
//! The binary converts these into `anyhow` errors at the command boundary.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransferError {
    /// An image could not be opened or decoded
    #[error("cannot read image {}: {}", .0.display(), .1)]
    ImageLoad(PathBuf, String),

    /// Class folders are missing, empty or inconsistent
    #[error("dataset: {0}")]
    Dataset(String),

    /// Backbone or head construction, weight loading, saving
    #[error("model: {0}")]
    Model(String),

    #[error("training: {0}")]
    Training(String),

    #[error("inference: {0}")]
    Inference(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON or TOML encoding of configs, summaries and checkpoints
    #[error("serialization: {0}")]
    Serialization(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("no such file or directory: {}", .0.display())]
    PathNotFound(PathBuf),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for TransferError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TransferError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for TransferError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageLoad(PathBuf::new(), err.to_string())
    }
}
