//! Frozen backbone plus trainable head, and its on-disk form.
//!
//! A saved model directory holds:
//! - `model_config.json`: [`TransferModelConfig`]
//! - `head.mpk`: the trained head
//! - `backbone.mpk` for a record backbone, or `backbone.onnx` for an
//!   exported one (referenced relative to the directory)

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use super::backbone::{Backbone, BackboneKind, BackboneSpec, FeatureExtractor};
use super::conv::{record_file, save_conv_backbone};
use super::head::{ClassifierHead, ClassifierHeadConfig};
use crate::dataset::Normalization;
use crate::utils::error::{Result, TransferError};

/// Record stem of the saved head
pub const HEAD_FILE: &str = "head";
/// Record stem of a saved Burn backbone
pub const BACKBONE_FILE: &str = "backbone";
/// File name of a bundled ONNX backbone
pub const BACKBONE_ONNX_FILE: &str = "backbone.onnx";
/// File name of the saved model configuration
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

/// Everything needed to rebuild a trained classifier
#[derive(Config, Debug)]
pub struct TransferModelConfig {
    pub backbone_kind: BackboneKind,
    pub backbone: BackboneSpec,
    pub head: ClassifierHeadConfig,
    /// Square input resolution
    pub image_size: usize,
    pub normalization: Normalization,
    /// Class names in label order
    pub class_names: Vec<String>,
}

impl TransferModelConfig {
    /// Input contract of `kind` with a head sized for `backbone`
    pub fn for_backbone(kind: BackboneKind, backbone: BackboneSpec, class_names: Vec<String>) -> Self {
        let head = ClassifierHeadConfig::new(backbone.feature_dim()).with_num_classes(class_names.len());
        Self::new(
            kind,
            backbone,
            head,
            kind.input_size(),
            kind.normalization(),
            class_names,
        )
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn validate(&self) -> Result<()> {
        self.backbone.validate()?;

        if self.class_names.len() < 2 {
            return Err(TransferError::Config(format!(
                "Need at least two classes, got {:?}",
                self.class_names
            )));
        }
        if self.head.num_classes != self.class_names.len() {
            return Err(TransferError::Config(format!(
                "Head has {} outputs but there are {} classes",
                self.head.num_classes,
                self.class_names.len()
            )));
        }
        if self.head.feature_dim != self.backbone.feature_dim() {
            return Err(TransferError::Config(format!(
                "Head expects {}-d features but the backbone produces {}",
                self.head.feature_dim,
                self.backbone.feature_dim()
            )));
        }
        if self.image_size < self.backbone.min_input_size() {
            return Err(TransferError::Config(format!(
                "Image size {} is smaller than the backbone minimum {}",
                self.image_size,
                self.backbone.min_input_size()
            )));
        }
        Ok(())
    }
}

/// Image classifier built from a frozen backbone and a linear head
#[derive(Debug)]
pub struct TransferClassifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> TransferClassifier<B> {
    /// Combine a (pretrained) backbone with a head
    pub fn new(backbone: impl Into<Backbone<B>>, head: ClassifierHead<B>) -> Result<Self> {
        let backbone = backbone.into();
        let features = backbone.feature_dim();
        let expected = head.feature_dim();
        if features != expected {
            return Err(TransferError::Model(format!(
                "Backbone produces {}-d features but the head expects {}",
                features, expected
            )));
        }

        Ok(Self {
            backbone: backbone.freeze(),
            head,
        })
    }

    /// Backbone from `config` (record weights from `weights`, if any) and a fresh head
    pub fn from_config(config: &TransferModelConfig, weights: Option<&Path>, device: &B::Device) -> Result<Self> {
        config.validate()?;
        let backbone = Backbone::build(&config.backbone, weights, device)?;
        Self::new(backbone, config.head.init(device))
    }

    /// Embeddings from the backbone
    pub fn features(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        self.backbone.extract(images)
    }

    /// Logits `[batch, num_classes]`
    pub fn forward(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        Ok(self.head.forward(self.features(images)?))
    }

    /// Class probabilities `[batch, num_classes]`
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        Ok(self.head.forward_softmax(self.features(images)?))
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    /// Parameters updated during training
    pub fn trainable_params(&self) -> usize {
        self.head.num_params()
    }

    /// Parameters held fixed, when the backbone is a Burn module
    pub fn frozen_params(&self) -> Option<usize> {
        self.backbone.frozen_params()
    }

    pub fn freeze_backbone(self) -> Self {
        Self {
            backbone: self.backbone.freeze(),
            head: self.head,
        }
    }

    /// Write head, backbone and configuration into `dir`; returns the head record path
    pub fn save(&self, dir: &Path, config: &TransferModelConfig) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let backbone = match &self.backbone {
            Backbone::Conv(conv) => {
                save_conv_backbone(conv, &dir.join(BACKBONE_FILE))?;
                config.backbone.clone()
            }
            Backbone::Onnx(onnx) => {
                let target = dir.join(BACKBONE_ONNX_FILE);
                if !same_file(&onnx.config().model_path, &target) {
                    std::fs::copy(&onnx.config().model_path, &target)?;
                }
                let mut bundled = onnx.config().clone();
                bundled.model_path = PathBuf::from(BACKBONE_ONNX_FILE);
                BackboneSpec::Onnx(bundled)
            }
        };

        let mut saved = config.clone();
        saved.backbone = backbone;
        saved
            .save(dir.join(MODEL_CONFIG_FILE))
            .map_err(|e| TransferError::Model(format!("Failed to save model config: {}", e)))?;

        self.head
            .clone()
            .save_file(dir.join(HEAD_FILE), &CompactRecorder::new())
            .map_err(|e| TransferError::Model(format!("Failed to save head: {:?}", e)))?;

        info!("Saved model to {:?}", dir);
        Ok(record_file::<B>(&dir.join(HEAD_FILE)))
    }

    /// Rebuild a model saved with [`TransferClassifier::save`]
    pub fn load(dir: &Path, device: &B::Device) -> Result<(Self, TransferModelConfig)> {
        let config_path = dir.join(MODEL_CONFIG_FILE);
        if !config_path.exists() {
            return Err(TransferError::PathNotFound(config_path));
        }

        let mut config = TransferModelConfig::load(&config_path)
            .map_err(|e| TransferError::Model(format!("Failed to read {:?}: {:?}", config_path, e)))?;
        if let BackboneSpec::Onnx(onnx) = &mut config.backbone {
            if onnx.model_path.is_relative() {
                onnx.model_path = dir.join(&onnx.model_path);
            }
        }
        config.validate()?;

        let weights = matches!(config.backbone, BackboneSpec::Record(_)).then(|| dir.join(BACKBONE_FILE));
        let backbone = Backbone::build(&config.backbone, weights.as_deref(), device)?;

        let head_path = record_file::<B>(&dir.join(HEAD_FILE));
        if !head_path.exists() {
            return Err(TransferError::PathNotFound(head_path));
        }
        let head = config
            .head
            .init::<B>(device)
            .load_file(dir.join(HEAD_FILE), &CompactRecorder::new(), device)
            .map_err(|e| TransferError::Model(format!("Failed to load head weights: {:?}", e)))?;

        info!(
            "Loaded {} model from {:?} ({} classes)",
            config.backbone_kind,
            dir,
            config.num_classes()
        );

        Ok((Self::new(backbone, head)?, config))
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
