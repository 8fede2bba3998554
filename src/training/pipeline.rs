//! End-to-end training run driven by an [`ExperimentConfig`]

use std::fs;
use std::path::{Path, PathBuf};

use burn::{
    module::{AutodiffModule, Module},
    optim::{decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, Optimizer, SgdConfig},
    tensor::backend::AutodiffBackend,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::checkpoint::{CheckpointManager, CheckpointMetadata};
use super::features::{BatchSource, FeatureCache};
use super::trainer::{Trainer, TrainingSummary};
use crate::config::{ExperimentConfig, OptimizerKind, TrainingConfig};
use crate::dataset::{
    AugmentingBatcher, ImageBatcher, ImageBurnDataset, ImageFolderDataset, RawImageDataset,
};
use crate::model::{Backbone, BackboneSpec, ClassifierHead, TransferClassifier, TransferModelConfig};
use crate::utils::error::{Result, TransferError};
use crate::utils::format_number;

/// File written next to the model with the run summary
pub const SUMMARY_FILE: &str = "training_summary.json";

/// What a finished run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    pub model_dir: PathBuf,
    pub class_names: Vec<String>,
    pub backbone: String,
    pub trainable_params: usize,
    /// Unknown for ONNX backbones
    pub frozen_params: Option<usize>,
    pub training_samples: usize,
    pub validation_samples: usize,
    pub finished_at: String,
    pub summary: TrainingSummary,
    pub config: ExperimentConfig,
}

impl TrainingReport {
    pub fn load(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(SUMMARY_FILE);
        if !path.exists() {
            return Err(TransferError::PathNotFound(path));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

/// Train a head for `config` and save the full model under `config.output.dir`
pub fn run_training<B: AutodiffBackend>(
    config: &ExperimentConfig,
    device: &B::Device,
) -> Result<TrainingReport> {
    config.validate()?;
    let training = &config.training;

    let mut train_folder = ImageFolderDataset::new(&config.data.train_dir)?;
    if let Some(max) = config.data.max_samples {
        train_folder.take(max, training.seed);
    }
    let class_names = train_folder.class_names.clone();
    info!("Training set: {}", train_folder.root_dir.display());
    train_folder.get_stats().print();

    let val_folder = match &config.data.val_dir {
        Some(dir) if dir.exists() => {
            let mut folder = ImageFolderDataset::with_class_names(dir, &class_names)?;
            if let Some(max) = config.data.max_samples {
                folder.take(max, training.seed);
            }
            info!("Validation set: {}", dir.display());
            folder.get_stats().print();
            Some(folder)
        }
        Some(dir) => {
            warn!("Validation directory {:?} does not exist; training without validation", dir);
            None
        }
        None => None,
    };

    let model_config = config.model_config(class_names.clone())?;
    let backbone = build_backbone::<B>(config, &model_config, device)?;
    let head = model_config.head.init::<B>(device);
    let frozen_params = backbone.frozen_params();
    let trainable_params = head.num_params();
    info!(
        "Model: {} backbone ({}), {} frozen / {} trainable parameters",
        model_config.backbone_kind,
        model_config.backbone,
        frozen_params.map_or_else(|| "external".to_string(), format_number),
        format_number(trainable_params)
    );

    let train_source = training_source::<B>(config, &model_config, &train_folder, &backbone, device)?;
    let val_source = match &val_folder {
        Some(folder) => Some(validation_source::<B>(config, &model_config, folder, &backbone, device)?),
        None => None,
    };

    let manager = CheckpointManager::new(
        config.output.dir.join("checkpoints"),
        config.output.keep_last_checkpoints,
    );
    let metadata = CheckpointMetadata {
        backbone: model_config.backbone_kind.to_string(),
        class_names: class_names.clone(),
        trainable_params,
        frozen_params,
        training_samples: train_source.len(),
    };

    let run = HeadRun {
        backbone,
        head,
        training: training.clone(),
        class_names: class_names.clone(),
        train: &train_source,
        val: val_source.as_ref(),
        checkpoints: (manager, metadata),
    };
    let (backbone, head, summary) = match training.optimizer {
        OptimizerKind::Sgd => run.fit(sgd_config(training).init(), device)?,
        OptimizerKind::Adam => run.fit(adam_config(training).init(), device)?,
    };

    let model = TransferClassifier::new(backbone, head.valid())?;
    model.save(&config.output.dir, &model_config)?;

    let report = TrainingReport {
        model_dir: config.output.dir.clone(),
        class_names,
        backbone: model_config.backbone_kind.to_string(),
        trainable_params,
        frozen_params,
        training_samples: train_source.len(),
        validation_samples: val_source.as_ref().map(|s| s.len()).unwrap_or(0),
        finished_at: Local::now().to_rfc3339(),
        summary,
        config: config.clone(),
    };
    let summary_path = config.output.dir.join(SUMMARY_FILE);
    fs::write(&summary_path, serde_json::to_string_pretty(&report)?)?;
    info!("Wrote run summary to {:?}", summary_path);

    Ok(report)
}

/// The exported graph for ONNX specs; for record specs the configured
/// weights, or a random backbone (useful only for smoke runs).
fn build_backbone<B: AutodiffBackend>(
    config: &ExperimentConfig,
    model_config: &TransferModelConfig,
    device: &B::Device,
) -> Result<Backbone<B::InnerBackend>> {
    let weights = match model_config.backbone {
        BackboneSpec::Record(_) => config.model.weights.as_deref(),
        BackboneSpec::Onnx(_) => None,
    };
    Backbone::build(&model_config.backbone, weights, device)
}

fn training_source<B: AutodiffBackend>(
    config: &ExperimentConfig,
    model_config: &TransferModelConfig,
    folder: &ImageFolderDataset,
    backbone: &Backbone<B::InnerBackend>,
    device: &B::Device,
) -> Result<BatchSource> {
    let training = &config.training;
    let pairs = folder.pairs();

    if training.augmentation.is_enabled() {
        if training.cache_features {
            info!("Augmentation is enabled, so backbone features are recomputed every batch");
        }
        let dataset = if config.data.cache_images {
            RawImageDataset::new_cached(pairs, model_config.image_size)?
        } else {
            RawImageDataset::new(pairs)
        };
        let batcher = AugmentingBatcher::new(
            training.augmentation.clone(),
            model_config.image_size,
            model_config.normalization,
            training.seed,
        );
        return Ok(BatchSource::Augmented { dataset, batcher });
    }

    image_source::<B>(
        config,
        model_config,
        pairs,
        backbone,
        training.uses_feature_cache(),
        device,
    )
}

/// Validation images are never augmented, so they can always be cached
fn validation_source<B: AutodiffBackend>(
    config: &ExperimentConfig,
    model_config: &TransferModelConfig,
    folder: &ImageFolderDataset,
    backbone: &Backbone<B::InnerBackend>,
    device: &B::Device,
) -> Result<BatchSource> {
    image_source::<B>(
        config,
        model_config,
        folder.pairs(),
        backbone,
        config.training.cache_features,
        device,
    )
}

fn image_source<B: AutodiffBackend>(
    config: &ExperimentConfig,
    model_config: &TransferModelConfig,
    pairs: Vec<(PathBuf, usize)>,
    backbone: &Backbone<B::InnerBackend>,
    cache_features: bool,
    device: &B::Device,
) -> Result<BatchSource> {
    let dataset = if config.data.cache_images || cache_features {
        ImageBurnDataset::new_cached(pairs, model_config.image_size)?
    } else {
        ImageBurnDataset::new(pairs, model_config.image_size)
    };
    let batcher = ImageBatcher::new(model_config.image_size, model_config.normalization);

    if cache_features {
        let cache = FeatureCache::build::<B::InnerBackend, _>(
            backbone,
            &dataset,
            &batcher,
            config.training.batch_size,
            device,
        )?;
        return Ok(BatchSource::Features(cache));
    }

    Ok(BatchSource::Images { dataset, batcher })
}

fn sgd_config(training: &TrainingConfig) -> SgdConfig {
    let mut config = SgdConfig::new();
    if training.momentum > 0.0 {
        config = config.with_momentum(Some(
            MomentumConfig::new()
                .with_momentum(training.momentum)
                .with_dampening(0.0),
        ));
    }
    if training.weight_decay > 0.0 {
        config = config.with_weight_decay(Some(WeightDecayConfig::new(training.weight_decay as f32)));
    }
    config
}

fn adam_config(training: &TrainingConfig) -> AdamConfig {
    let mut config = AdamConfig::new();
    if training.weight_decay > 0.0 {
        config = config.with_weight_decay(Some(WeightDecayConfig::new(training.weight_decay as f32)));
    }
    config
}

/// Everything a head-training run needs apart from the optimizer
struct HeadRun<'a, B: AutodiffBackend> {
    backbone: Backbone<B::InnerBackend>,
    head: ClassifierHead<B>,
    training: TrainingConfig,
    class_names: Vec<String>,
    train: &'a BatchSource,
    val: Option<&'a BatchSource>,
    checkpoints: (CheckpointManager, CheckpointMetadata),
}

impl<B: AutodiffBackend> HeadRun<'_, B> {
    fn fit<O>(
        self,
        optimizer: O,
        device: &B::Device,
    ) -> Result<(Backbone<B::InnerBackend>, ClassifierHead<B>, TrainingSummary)>
    where
        O: Optimizer<ClassifierHead<B>, B>,
    {
        let (manager, metadata) = self.checkpoints;
        let mut trainer = Trainer::new(
            self.backbone,
            self.head,
            optimizer,
            self.training,
            self.class_names,
            device.clone(),
        )?
        .with_checkpoints(manager, metadata);

        let summary = trainer.fit(self.train, self.val)?;
        let (backbone, head, _) = trainer.into_parts();
        Ok((backbone, head, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataSection, ModelSection, OutputSection};
    use crate::dataset::AugmentationConfig;
    use crate::model::onnx::test_graph::write_pooling_model;
    use crate::model::{BackboneKind, TensorLayout};
    use burn::backend::Autodiff;
    use burn::data::dataset::Dataset;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn write_split(root: &Path, per_class: usize) {
        for (class, value) in [("rural", 30u8), ("urban", 220u8)] {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let img = ImageBuffer::from_pixel(20, 20, Rgb([value, value.wrapping_add(i as u8), value]));
                img.save(dir.join(format!("{class}_{i}.png"))).unwrap();
            }
        }
    }

    fn small_config(root: &Path) -> ExperimentConfig {
        ExperimentConfig {
            model: ModelSection {
                backbone: BackboneKind::Compact,
                image_size: Some(16),
                stage_filters: Some(vec![4, 8]),
                ..ModelSection::default()
            },
            data: DataSection {
                train_dir: root.join("train"),
                val_dir: Some(root.join("val")),
                max_samples: None,
                cache_images: true,
            },
            training: TrainingConfig {
                epochs: 2,
                batch_size: 4,
                learning_rate: 0.05,
                augmentation: AugmentationConfig::none(),
                ..TrainingConfig::default()
            },
            output: OutputSection {
                dir: root.join("out"),
                keep_last_checkpoints: 1,
            },
        }
    }

    #[test]
    fn test_run_training_writes_model_and_summary() {
        let root = TempDir::new().unwrap();
        write_split(&root.path().join("train"), 6);
        write_split(&root.path().join("val"), 3);
        let config = small_config(root.path());

        let report = run_training::<TestBackend>(&config, &Default::default()).unwrap();

        assert_eq!(report.class_names, vec!["rural", "urban"]);
        assert_eq!(report.training_samples, 12);
        assert_eq!(report.validation_samples, 6);
        assert_eq!(report.summary.epochs_run, 2);

        let out = root.path().join("out");
        assert!(out.join("head.mpk").exists());
        assert!(out.join("backbone.mpk").exists());
        assert!(out.join("model_config.json").exists());
        assert!(out.join("checkpoints").join("latest.json").exists());

        let reloaded = TrainingReport::load(&out).unwrap();
        assert_eq!(reloaded.summary.epochs_run, 2);

        let (model, model_config) = TransferClassifier::<NdArray>::load(&out, &Default::default()).unwrap();
        assert_eq!(model.num_classes(), 2);
        assert_eq!(model_config.image_size, 16);
    }

    #[test]
    fn test_run_training_with_augmentation_and_adam() {
        let root = TempDir::new().unwrap();
        write_split(&root.path().join("train"), 4);
        let mut config = small_config(root.path());
        config.data.val_dir = None;
        config.training.optimizer = OptimizerKind::Adam;
        config.training.augmentation = AugmentationConfig::default();
        config.training.steps_per_epoch = Some(3);

        let report = run_training::<TestBackend>(&config, &Default::default()).unwrap();

        assert_eq!(report.validation_samples, 0);
        assert!(report.summary.best_val_accuracy.is_none());
        assert_eq!(report.summary.history[0].batches, 3);
    }

    #[test]
    fn test_augmented_source_respects_cache_images() {
        let root = TempDir::new().unwrap();
        write_split(&root.path().join("train"), 2);
        let mut config = small_config(root.path());
        config.training.augmentation = AugmentationConfig::default();

        let device = Default::default();
        let folder = ImageFolderDataset::new(&config.data.train_dir).unwrap();
        let model_config = config.model_config(folder.class_names.clone()).unwrap();
        let backbone = build_backbone::<TestBackend>(&config, &model_config, &device).unwrap();

        for cache_images in [false, true] {
            config.data.cache_images = cache_images;
            let source =
                training_source::<TestBackend>(&config, &model_config, &folder, &backbone, &device).unwrap();
            let BatchSource::Augmented { dataset, .. } = &source else {
                panic!("expected augmented batches");
            };
            assert_eq!(dataset.is_cached(), cache_images);

            // cached copies are stored at model resolution, lazy ones at file size
            let item = dataset.get(0).unwrap();
            let expected = if cache_images { 16 } else { 20 };
            assert_eq!((item.image.width(), item.image.height()), (expected, expected));
        }
    }

    #[test]
    fn test_run_training_with_onnx_backbone() {
        let root = TempDir::new().unwrap();
        write_split(&root.path().join("train"), 4);
        write_split(&root.path().join("val"), 2);
        let weights = write_pooling_model(root.path(), TensorLayout::Nhwc);

        let mut config = small_config(root.path());
        config.model = ModelSection {
            backbone: BackboneKind::Xception,
            weights: Some(weights),
            image_size: Some(16),
            output_name: Some("features".to_string()),
            feature_dim: Some(3),
            ..ModelSection::default()
        };
        config.training.cache_features = true;

        let report = run_training::<TestBackend>(&config, &Default::default()).unwrap();
        assert_eq!(report.frozen_params, None);
        assert_eq!(report.trainable_params, 3 * 2 + 2);

        let out = root.path().join("out");
        assert!(out.join("backbone.onnx").exists());
        assert!(!out.join("backbone.mpk").exists());

        let (model, model_config) = TransferClassifier::<NdArray>::load(&out, &Default::default()).unwrap();
        assert_eq!(model.num_classes(), 2);
        assert!(matches!(model_config.backbone, BackboneSpec::Onnx(_)));
    }

    #[test]
    fn test_missing_train_dir_fails() {
        let root = TempDir::new().unwrap();
        let config = small_config(root.path());
        assert!(run_training::<TestBackend>(&config, &Default::default()).is_err());
    }
}
