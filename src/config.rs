//! Experiment configuration
//!
//! Loaded from TOML; every field has a default so a partial file (or no
//! file at all) is valid. Command-line flags are applied on top.
//!
//! ```toml
//! [model]
//! backbone = "resnet50"
//! weights = "weights/resnet50_notop.onnx"
//!
//! [data]
//! train_dir = "data/train"
//! val_dir = "data/val"
//!
//! [training]
//! epochs = 10
//! batch_size = 24
//! learning_rate = 0.01
//! optimizer = "sgd"
//! steps_per_epoch = 100
//!
//! [training.augmentation]
//! horizontal_flip_prob = 0.5
//! width_shift_range = 0.2
//! height_shift_range = 0.2
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dataset::{AugmentationConfig, Normalization};
use crate::model::{
    BackboneKind, BackboneSpec, ClassifierHeadConfig, ConvBackboneConfig, OnnxBackboneConfig,
    TensorLayout, TransferModelConfig,
};
use crate::utils::error::{Result, TransferError};

/// Read and parse a TOML file
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path)
        .map_err(|e| TransferError::Config(format!("Failed to read config {}: {e}", path.display())))?;

    toml::from_str(&content)
        .map_err(|e| TransferError::Config(format!("Failed to parse config {}: {e}", path.display())))
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: ModelSection,
    pub data: DataSection,
    pub training: TrainingConfig,
    pub output: OutputSection,
}

impl ExperimentConfig {
    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;

        if let Some(size) = self.model.image_size {
            if size == 0 {
                return Err(TransferError::Config("image_size must be positive".to_string()));
            }
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(TransferError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        if self.output.keep_last_checkpoints == 0 {
            return Err(TransferError::Config(
                "keep_last_checkpoints must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Model configuration for the given classes, with overrides applied
    pub fn model_config(&self, class_names: Vec<String>) -> Result<TransferModelConfig> {
        let kind = self.model.backbone;

        let backbone = self.model.backbone_spec()?;
        let head = ClassifierHeadConfig::new(backbone.feature_dim())
            .with_num_classes(class_names.len())
            .with_dropout(self.model.dropout);

        let config = TransferModelConfig::new(
            kind,
            backbone,
            head,
            self.model.image_size.unwrap_or_else(|| kind.input_size()),
            self.model.normalization.unwrap_or_else(|| kind.normalization()),
            class_names,
        );
        config.validate()?;

        Ok(config)
    }
}

/// Backbone selection and input contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub backbone: BackboneKind,
    /// Pretrained weights: an `.onnx` export, or a Burn record for the
    /// compact backbone (random weights when absent)
    pub weights: Option<PathBuf>,
    /// Image input layout of an ONNX export
    pub input_layout: Option<TensorLayout>,
    /// Pooled output of an ONNX export; `avg_pool` when absent
    pub output_name: Option<String>,
    /// Embedding width of an ONNX export; the preset's when absent
    pub feature_dim: Option<usize>,
    /// Overrides the backbone's native input size
    pub image_size: Option<usize>,
    /// Overrides the backbone's native normalization
    pub normalization: Option<Normalization>,
    /// Overrides the preset stage widths
    pub stage_filters: Option<Vec<usize>>,
    /// Dropout in front of the head
    pub dropout: f64,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::ResNet50,
            weights: None,
            input_layout: None,
            output_name: None,
            feature_dim: None,
            image_size: None,
            normalization: None,
            stage_filters: None,
            dropout: 0.0,
        }
    }
}

impl ModelSection {
    /// An ONNX spec when `weights` is an `.onnx` file, otherwise a Burn
    /// record stack. ResNet50 and Xception only exist as exports.
    pub fn backbone_spec(&self) -> Result<BackboneSpec> {
        let onnx_weights = self
            .weights
            .as_ref()
            .filter(|path| path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("onnx")));

        if let Some(path) = onnx_weights {
            let mut config = OnnxBackboneConfig::new(
                path.clone(),
                self.feature_dim.unwrap_or_else(|| self.backbone.feature_dim()),
            )
            .with_input_layout(self.input_layout.unwrap_or_default());
            if let Some(name) = &self.output_name {
                config = config.with_output_name(name.clone());
            }
            return Ok(BackboneSpec::Onnx(config));
        }

        if self.backbone.is_exported() && self.stage_filters.is_none() {
            return Err(TransferError::Config(format!(
                "the {} backbone is loaded from an ONNX export (include_top=False, pooling=\"avg\"); \
                 set model.weights to the .onnx file",
                self.backbone
            )));
        }

        let stages = self
            .stage_filters
            .clone()
            .unwrap_or_else(|| ConvBackboneConfig::compact().stage_filters);
        Ok(BackboneSpec::Record(ConvBackboneConfig::new(stages)))
    }
}

/// Where the images live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSection {
    /// One sub-directory per class
    pub train_dir: PathBuf,
    /// Same class directories as `train_dir`
    pub val_dir: Option<PathBuf>,
    /// Cap on training samples (seeded random subset)
    pub max_samples: Option<usize>,
    /// Decode all images into memory before training
    pub cache_images: bool,
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            train_dir: PathBuf::from("data/train"),
            val_dir: Some(PathBuf::from("data/val")),
            max_samples: None,
            cache_images: true,
        }
    }
}

/// Output locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub dir: PathBuf,
    pub keep_last_checkpoints: usize,
}

impl Default for OutputSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output"),
            keep_last_checkpoints: 3,
        }
    }
}

/// Optimizer used for the head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Sgd,
    Adam,
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => write!(f, "sgd"),
            OptimizerKind::Adam => write!(f, "adam"),
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            other => Err(TransferError::InvalidInput(format!(
                "Unknown optimizer '{}' (expected sgd or adam)",
                other
            ))),
        }
    }
}

/// Stop when validation accuracy has not improved for `patience` epochs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub patience: usize,
    /// Smallest accuracy gain that counts as an improvement
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 3,
            min_delta: 0.0,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub optimizer: OptimizerKind,
    /// SGD momentum (0 disables)
    pub momentum: f64,
    pub weight_decay: f64,
    /// Gradient steps per epoch; a full pass when absent
    pub steps_per_epoch: Option<usize>,
    /// Validation batches per evaluation; the full set when absent
    pub validation_steps: Option<usize>,
    pub seed: u64,
    /// Reuse backbone embeddings across epochs when nothing is augmented
    pub cache_features: bool,
    /// Batches between progress lines
    pub log_interval: usize,
    pub augmentation: AugmentationConfig,
    pub early_stopping: Option<EarlyStoppingConfig>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 24,
            learning_rate: 0.01,
            optimizer: OptimizerKind::Sgd,
            momentum: 0.0,
            weight_decay: 0.0,
            steps_per_epoch: None,
            validation_steps: None,
            seed: 42,
            cache_features: true,
            log_interval: 10,
            augmentation: AugmentationConfig::default(),
            early_stopping: None,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(TransferError::Config("epochs must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(TransferError::Config("batch_size must be at least 1".to_string()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(TransferError::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(TransferError::Config(format!(
                "momentum must be in [0, 1), got {}",
                self.momentum
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(TransferError::Config("weight_decay must not be negative".to_string()));
        }
        if self.steps_per_epoch == Some(0) || self.validation_steps == Some(0) {
            return Err(TransferError::Config(
                "steps_per_epoch and validation_steps must be at least 1 when set".to_string(),
            ));
        }
        if self.log_interval == 0 {
            return Err(TransferError::Config("log_interval must be at least 1".to_string()));
        }
        self.augmentation.validate()
    }

    /// Whether backbone features can be computed once and reused
    pub fn uses_feature_cache(&self) -> bool {
        self.cache_features && !self.augmentation.is_enabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_follow_reference_setup() {
        let config = ExperimentConfig::default();
        assert_eq!(config.model.backbone, BackboneKind::ResNet50);
        assert_eq!(config.training.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.training.learning_rate, 0.01);
        assert_eq!(config.training.augmentation.width_shift_range, 0.2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: ExperimentConfig = toml::from_str(
            r#"
            [model]
            backbone = "xception"

            [training]
            epochs = 3
            optimizer = "adam"

            [training.augmentation]
            horizontal_flip_prob = 0.0
            width_shift_range = 0.0
            height_shift_range = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.model.backbone, BackboneKind::Xception);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.training.optimizer, OptimizerKind::Adam);
        assert_eq!(config.training.batch_size, 24);
        assert!(config.training.uses_feature_cache());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("experiment.toml");

        let mut config = ExperimentConfig::default();
        config.training.steps_per_epoch = Some(50);
        config.training.early_stopping = Some(EarlyStoppingConfig::default());
        fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        assert_eq!(ExperimentConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ExperimentConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.training.learning_rate = -1.0;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.training.augmentation.horizontal_flip_prob = 1.5;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.training.steps_per_epoch = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_model_config_overrides() {
        let mut config = ExperimentConfig::default();
        config.model.backbone = BackboneKind::Compact;
        config.model.stage_filters = Some(vec![8, 16]);
        config.model.image_size = Some(32);

        let classes = vec!["rural".to_string(), "urban".to_string()];
        let model = config.model_config(classes).unwrap();
        assert_eq!(model.head.feature_dim, 16);
        assert_eq!(model.image_size, 32);
        assert_eq!(model.normalization, Normalization::ImageNet);

        assert!(config.model_config(vec!["only".to_string()]).is_err());
    }

    #[test]
    fn test_exported_backbones_need_onnx_weights() {
        let classes = vec!["rural".to_string(), "urban".to_string()];
        let mut config = ExperimentConfig::default();
        assert!(matches!(config.model_config(classes.clone()), Err(TransferError::Config(_))));

        config.model.weights = Some(PathBuf::from("weights/resnet50_notop.onnx"));
        let model = config.model_config(classes.clone()).unwrap();
        assert_eq!(model.image_size, 224);
        assert_eq!(model.normalization, Normalization::Caffe);
        assert_eq!(model.head.feature_dim, 2048);
        let BackboneSpec::Onnx(onnx) = &model.backbone else {
            panic!("expected an onnx backbone");
        };
        assert_eq!(onnx.input_layout, TensorLayout::Nhwc);
        assert_eq!(onnx.output_name, "avg_pool");

        config.model.backbone = BackboneKind::Xception;
        config.model.weights = Some(PathBuf::from("xception.ONNX"));
        config.model.input_layout = Some(TensorLayout::Nchw);
        config.model.output_name = Some("global_average_pooling2d".to_string());
        let model = config.model_config(classes).unwrap();
        assert_eq!(model.image_size, 299);
        assert_eq!(model.normalization, Normalization::Symmetric);
        assert!(matches!(&model.backbone, BackboneSpec::Onnx(c) if c.input_layout == TensorLayout::Nchw));
    }

    #[test]
    fn test_compact_uses_record_weights() {
        let mut config = ExperimentConfig::default();
        config.model.backbone = BackboneKind::Compact;
        config.model.weights = Some(PathBuf::from("weights/compact"));

        let spec = config.model.backbone_spec().unwrap();
        assert!(matches!(spec, BackboneSpec::Record(c) if c.stage_filters == vec![32, 64, 128]));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = ExperimentConfig::load(Path::new("/nope/config.toml")).unwrap_err();
        assert!(matches!(err, TransferError::Config(_)));
    }

    #[test]
    fn test_parse_optimizer() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert!("rmsprop".parse::<OptimizerKind>().is_err());
    }
}
