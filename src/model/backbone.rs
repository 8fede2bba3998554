//! Frozen feature extractors
//!
//! A backbone maps a normalized image batch `[batch, 3, h, w]` to a fixed
//! size embedding `[batch, feature_dim]`. Its weights come from elsewhere
//! and are never updated here. The ResNet50 and Xception presets are
//! ImageNet-pretrained Keras applications exported to ONNX
//! ([`super::onnx`]); the compact preset is a Burn record ([`super::conv`]).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::{
    module::Module,
    tensor::{backend::Backend, Tensor},
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::conv::{load_conv_backbone, ConvBackbone, ConvBackboneConfig};
use super::onnx::{OnnxBackbone, OnnxBackboneConfig};
use crate::dataset::Normalization;
use crate::utils::error::{Result, TransferError};

/// Image-to-embedding function used as a frozen backbone
pub trait FeatureExtractor<B: Backend> {
    /// `[batch, 3, h, w]` -> `[batch, feature_dim]`
    fn extract(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>>;

    /// Width of the embedding
    fn feature_dim(&self) -> usize;
}

/// Pretrained backbone families and the input contract each one expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    /// Keras ResNet50, `pooling="avg"`: 224 px, caffe preprocessing
    ResNet50,
    /// Keras Xception, `pooling="avg"`: 299 px, `[-1, 1]` inputs
    Xception,
    /// Small Burn stack for quick experiments and tests
    Compact,
}

impl BackboneKind {
    /// Square input resolution the pretrained weights were trained at
    pub fn input_size(&self) -> usize {
        match self {
            BackboneKind::ResNet50 | BackboneKind::Compact => 224,
            BackboneKind::Xception => 299,
        }
    }

    pub fn normalization(&self) -> Normalization {
        match self {
            BackboneKind::ResNet50 => Normalization::Caffe,
            BackboneKind::Xception => Normalization::Symmetric,
            BackboneKind::Compact => Normalization::ImageNet,
        }
    }

    pub fn feature_dim(&self) -> usize {
        match self {
            BackboneKind::ResNet50 | BackboneKind::Xception => 2048,
            BackboneKind::Compact => ConvBackboneConfig::compact().feature_dim(),
        }
    }

    /// Whether weights for this family only come as an ONNX export
    pub fn is_exported(&self) -> bool {
        !matches!(self, BackboneKind::Compact)
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneKind::ResNet50 => write!(f, "resnet50"),
            BackboneKind::Xception => write!(f, "xception"),
            BackboneKind::Compact => write!(f, "compact"),
        }
    }
}

impl FromStr for BackboneKind {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "resnet50" | "resnet" => Ok(BackboneKind::ResNet50),
            "xception" => Ok(BackboneKind::Xception),
            "compact" => Ok(BackboneKind::Compact),
            other => Err(TransferError::InvalidInput(format!(
                "Unknown backbone '{}' (expected resnet50, xception or compact)",
                other
            ))),
        }
    }
}

/// How to construct a backbone; stored in the saved model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum BackboneSpec {
    /// Burn convolutional stack, weights from a `CompactRecorder` record
    Record(ConvBackboneConfig),
    /// Exported graph run by ONNX Runtime
    Onnx(OnnxBackboneConfig),
}

impl BackboneSpec {
    pub fn feature_dim(&self) -> usize {
        match self {
            BackboneSpec::Record(config) => config.feature_dim(),
            BackboneSpec::Onnx(config) => config.feature_dim,
        }
    }

    /// Smallest input side the backbone accepts
    pub fn min_input_size(&self) -> usize {
        match self {
            BackboneSpec::Record(config) => config.min_input_size(),
            BackboneSpec::Onnx(_) => 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            BackboneSpec::Record(config) => config.validate(),
            BackboneSpec::Onnx(config) => config.validate(),
        }
    }
}

impl fmt::Display for BackboneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackboneSpec::Record(config) => write!(f, "record {:?}", config.stage_filters),
            BackboneSpec::Onnx(config) => write!(f, "onnx {:?}", config.model_path),
        }
    }
}

/// A loaded, frozen backbone of either format
#[derive(Debug)]
pub enum Backbone<B: Backend> {
    Conv(ConvBackbone<B>),
    Onnx(OnnxBackbone),
}

impl<B: Backend> Backbone<B> {
    /// Build the backbone described by `spec`.
    ///
    /// A record backbone loads `weights` when given and is otherwise
    /// randomly initialized; an ONNX backbone always loads its model file.
    pub fn build(spec: &BackboneSpec, weights: Option<&Path>, device: &B::Device) -> Result<Self> {
        spec.validate()?;
        match spec {
            BackboneSpec::Record(config) => match weights {
                Some(path) => Ok(Backbone::Conv(load_conv_backbone(config, path, device)?)),
                None => {
                    warn!("No backbone weights configured; using a randomly initialized backbone");
                    Ok(Backbone::Conv(config.init(device).freeze()))
                }
            },
            BackboneSpec::Onnx(config) => Ok(Backbone::Onnx(OnnxBackbone::load(config.clone())?)),
        }
    }

    /// Parameter count of a Burn backbone; unknown for ONNX graphs
    pub fn frozen_params(&self) -> Option<usize> {
        match self {
            Backbone::Conv(conv) => Some(conv.num_params()),
            Backbone::Onnx(_) => None,
        }
    }

    pub fn freeze(self) -> Self {
        match self {
            Backbone::Conv(conv) => Backbone::Conv(conv.freeze()),
            onnx => onnx,
        }
    }
}

impl<B: Backend> FeatureExtractor<B> for Backbone<B> {
    fn extract(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        match self {
            Backbone::Conv(conv) => conv.extract(images),
            Backbone::Onnx(onnx) => onnx.extract(images),
        }
    }

    fn feature_dim(&self) -> usize {
        match self {
            Backbone::Conv(conv) => FeatureExtractor::<B>::feature_dim(conv),
            Backbone::Onnx(onnx) => FeatureExtractor::<B>::feature_dim(onnx),
        }
    }
}

impl<B: Backend> From<ConvBackbone<B>> for Backbone<B> {
    fn from(conv: ConvBackbone<B>) -> Self {
        Backbone::Conv(conv)
    }
}
