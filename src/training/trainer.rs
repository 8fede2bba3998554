//! Head-only training loop
//!
//! The backbone runs on the inner (non-autodiff) backend, so no graph is
//! recorded for it. Its embeddings are lifted into the autodiff backend with
//! `Tensor::from_inner`, and gradients therefore stop at the head.

use std::time::Instant;

use burn::{
    module::AutodiffModule,
    nn::loss::CrossEntropyLossConfig,
    optim::{GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::checkpoint::{Checkpoint, CheckpointManager, CheckpointMetadata};
use super::features::{extract_batch, BatchSource};
use crate::config::TrainingConfig;
use crate::model::{ClassifierHead, FeatureExtractor};
use crate::utils::error::{Result, TransferError};
use crate::utils::metrics::{Metrics, RunningAverage};
use crate::utils::{seeded_rng, RngStream, TrainingLogger};

/// Results of one training epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 0-based epoch index
    pub epoch: usize,
    pub train_loss: f64,
    /// Fraction of training samples classified correctly
    pub train_accuracy: f64,
    pub val_loss: Option<f64>,
    pub val_accuracy: Option<f64>,
    pub batches: usize,
    pub samples: usize,
    pub duration_secs: f64,
}

/// Progress across epochs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingState {
    pub history: Vec<EpochMetrics>,
    pub best_val_accuracy: Option<f64>,
    pub best_epoch: Option<usize>,
    pub epochs_without_improvement: usize,
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an epoch; returns true if it set a new best validation
    /// accuracy (by more than `min_delta`).
    pub fn record_epoch(&mut self, metrics: EpochMetrics, min_delta: f64) -> bool {
        let improved = match (metrics.val_accuracy, self.best_val_accuracy) {
            (Some(acc), Some(best)) => acc > best + min_delta,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if improved {
            self.best_val_accuracy = metrics.val_accuracy;
            self.best_epoch = Some(metrics.epoch);
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }

        self.history.push(metrics);
        improved
    }

    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.history.last()
    }
}

/// Outcome of [`Trainer::fit`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSummary {
    pub epochs_run: usize,
    pub best_epoch: Option<usize>,
    pub best_val_accuracy: Option<f64>,
    pub final_train_loss: f64,
    pub final_train_accuracy: f64,
    pub stopped_early: bool,
    pub duration_secs: f64,
    pub history: Vec<EpochMetrics>,
}

/// Shuffled index batches for one epoch.
///
/// Without `steps` this is a single pass with a possibly short last batch.
/// With `steps`, passes are reshuffled and concatenated until exactly
/// `steps` batches exist.
pub fn epoch_batches(
    len: usize,
    batch_size: usize,
    steps: Option<usize>,
    rng: &mut ChaCha8Rng,
) -> Vec<Vec<usize>> {
    if len == 0 || batch_size == 0 {
        return Vec::new();
    }

    let mut batches = Vec::new();
    loop {
        let mut indices: Vec<usize> = (0..len).collect();
        indices.shuffle(rng);

        for chunk in indices.chunks(batch_size) {
            if steps.is_some_and(|s| batches.len() >= s) {
                return batches;
            }
            batches.push(chunk.to_vec());
        }

        match steps {
            Some(s) if batches.len() < s => continue,
            _ => return batches,
        }
    }
}

/// Indices scored by [`Trainer::evaluate`].
///
/// Everything in order when `steps` is unset or covers the whole set;
/// otherwise a seeded subset of `steps * batch_size`, so folder-ordered
/// datasets are not cut off after the first classes.
pub fn validation_indices(len: usize, batch_size: usize, steps: Option<usize>, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    let limit = match steps {
        Some(steps) => steps.saturating_mul(batch_size).min(len),
        None => return indices,
    };
    if limit < len {
        indices.shuffle(&mut seeded_rng(seed, RngStream::Validation, 0));
        indices.truncate(limit);
    }
    indices
}

/// Number of rows whose argmax equals the target
fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let n = targets.dims()[0];
    let predictions = logits.argmax(1).reshape([n]);
    let correct: i64 = predictions.equal(targets).int().sum().into_scalar().elem();
    correct as usize
}

fn to_labels<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map(|v| v.into_iter().map(|x| x as usize).collect())
        .map_err(|e| TransferError::Training(format!("Failed to read labels: {:?}", e)))
}

/// Trains a [`ClassifierHead`] on top of a frozen feature extractor
pub struct Trainer<B, E, O>
where
    B: AutodiffBackend,
    E: FeatureExtractor<B::InnerBackend>,
    O: Optimizer<ClassifierHead<B>, B>,
{
    extractor: E,
    head: ClassifierHead<B>,
    best_head: Option<ClassifierHead<B>>,
    optimizer: O,
    config: TrainingConfig,
    class_names: Vec<String>,
    state: TrainingState,
    checkpoints: Option<(CheckpointManager, CheckpointMetadata)>,
    device: B::Device,
}

impl<B, E, O> Trainer<B, E, O>
where
    B: AutodiffBackend,
    E: FeatureExtractor<B::InnerBackend>,
    O: Optimizer<ClassifierHead<B>, B>,
{
    pub fn new(
        extractor: E,
        head: ClassifierHead<B>,
        optimizer: O,
        config: TrainingConfig,
        class_names: Vec<String>,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;

        if extractor.feature_dim() != head.feature_dim() {
            return Err(TransferError::Model(format!(
                "Extractor produces {}-d features but the head expects {}",
                extractor.feature_dim(),
                head.feature_dim()
            )));
        }
        if class_names.len() != head.num_classes() {
            return Err(TransferError::Model(format!(
                "{} class names for a head with {} outputs",
                class_names.len(),
                head.num_classes()
            )));
        }

        Ok(Self {
            extractor,
            head,
            best_head: None,
            optimizer,
            config,
            class_names,
            state: TrainingState::new(),
            checkpoints: None,
            device,
        })
    }

    /// Write a checkpoint after every epoch
    pub fn with_checkpoints(mut self, manager: CheckpointManager, metadata: CheckpointMetadata) -> Self {
        self.checkpoints = Some((manager, metadata));
        self
    }

    pub fn head(&self) -> &ClassifierHead<B> {
        &self.head
    }

    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// One pass of gradient steps over `source`
    pub fn train_epoch(&mut self, source: &BatchSource, epoch: usize) -> Result<EpochMetrics> {
        if source.is_empty() {
            return Err(TransferError::Training("Training set is empty".to_string()));
        }

        let start = Instant::now();
        let mut rng = seeded_rng(self.config.seed, RngStream::Shuffle, epoch as u64);
        let batches = epoch_batches(
            source.len(),
            self.config.batch_size,
            self.config.steps_per_epoch,
            &mut rng,
        );
        let num_batches = batches.len();

        let loss_fn = CrossEntropyLossConfig::new().init::<B>(&self.device);
        let mut loss_avg = RunningAverage::new();
        let mut correct = 0usize;
        let mut seen = 0usize;

        for (batch_idx, indices) in batches.iter().enumerate() {
            let Some(batch) =
                extract_batch::<B::InnerBackend, E>(&self.extractor, source, indices, &self.device)?
            else {
                warn!("Skipping batch {} with no loadable samples", batch_idx + 1);
                continue;
            };

            let features = Tensor::<B, 2>::from_inner(batch.features);
            let targets = Tensor::<B, 1, Int>::from_inner(batch.targets);
            let batch_len = targets.dims()[0];

            let logits = self.head.forward(features);
            let loss = loss_fn.forward(logits.clone(), targets.clone());
            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                return Err(TransferError::Training(format!(
                    "Loss diverged at epoch {} batch {}",
                    epoch + 1,
                    batch_idx + 1
                )));
            }

            correct += count_correct(logits.detach(), targets);
            seen += batch_len;
            loss_avg.update(loss_value);

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &self.head);
            self.head = self
                .optimizer
                .step(self.config.learning_rate, self.head.clone(), grads);

            if (batch_idx + 1) % self.config.log_interval == 0 || batch_idx + 1 == num_batches {
                info!(
                    "  Batch {:>4}/{}: loss = {:.4}, acc = {:.2}%",
                    batch_idx + 1,
                    num_batches,
                    loss_value,
                    100.0 * correct as f64 / seen.max(1) as f64
                );
            }
        }

        if seen == 0 {
            return Err(TransferError::Training(
                "No training samples could be loaded".to_string(),
            ));
        }

        Ok(EpochMetrics {
            epoch,
            train_loss: loss_avg.average(),
            train_accuracy: correct as f64 / seen as f64,
            val_loss: None,
            val_accuracy: None,
            batches: loss_avg.count(),
            samples: seen,
            duration_secs: start.elapsed().as_secs_f64(),
        })
    }

    /// Loss, accuracy and confusion matrix of the current head on `source`.
    ///
    /// With `validation_steps` set, only `steps * batch_size` samples are
    /// scored: a seeded random subset, the same one every epoch.
    pub fn evaluate(&self, source: &BatchSource) -> Result<Metrics> {
        let head = self.head.clone().valid();
        let loss_fn = CrossEntropyLossConfig::new().init::<B::InnerBackend>(&self.device);

        let batch_size = self.config.batch_size;
        let indices = validation_indices(source.len(), batch_size, self.config.validation_steps, self.config.seed);
        let limit = indices.len();

        let mut loss_avg = RunningAverage::new();
        let mut predictions = Vec::with_capacity(limit);
        let mut ground_truth = Vec::with_capacity(limit);

        for chunk in indices.chunks(batch_size) {
            let Some(batch) =
                extract_batch::<B::InnerBackend, E>(&self.extractor, source, chunk, &self.device)?
            else {
                continue;
            };

            let n = batch.targets.dims()[0];
            let logits = head.forward(batch.features);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
            loss_avg.update(loss.into_scalar().elem::<f64>());

            predictions.extend(to_labels(logits.argmax(1).reshape([n]))?);
            ground_truth.extend(to_labels(batch.targets)?);
        }

        if predictions.is_empty() {
            return Err(TransferError::Training(
                "No validation samples could be loaded".to_string(),
            ));
        }

        debug!("Evaluated {} samples", predictions.len());

        Ok(
            Metrics::from_predictions(&predictions, &ground_truth, self.class_names.len())
                .with_loss(loss_avg.average())
                .with_class_names(&self.class_names),
        )
    }

    /// Train for the configured number of epochs
    pub fn fit(&mut self, train: &BatchSource, val: Option<&BatchSource>) -> Result<TrainingSummary> {
        let start = Instant::now();
        let epochs = self.config.epochs;
        let early_stopping = self.config.early_stopping.clone();

        if val.is_none() && early_stopping.is_some() {
            warn!("Early stopping needs a validation set; it is disabled for this run");
        }

        info!(
            "Training head on {} {} for {} epochs (batch size {}, {} lr {})",
            train.len(),
            train.kind(),
            epochs,
            self.config.batch_size,
            self.config.optimizer,
            self.config.learning_rate
        );

        let mut logger = TrainingLogger::new(epochs);
        let mut stopped_early = false;

        for epoch in 0..epochs {
            logger.start_epoch(epoch);

            let mut metrics = self.train_epoch(train, epoch)?;
            if let Some(val) = val {
                let val_metrics = self.evaluate(val)?;
                metrics.val_loss = val_metrics.average_loss;
                metrics.val_accuracy = Some(val_metrics.accuracy);
            }

            logger.end_epoch(metrics.train_loss, metrics.train_accuracy, metrics.val_accuracy);

            let min_delta = early_stopping.as_ref().map(|es| es.min_delta).unwrap_or(0.0);
            let val_accuracy = metrics.val_accuracy;
            let improved = self.state.record_epoch(metrics, min_delta);
            if improved {
                if let Some(acc) = val_accuracy {
                    logger.log_new_best(acc);
                }
                self.best_head = Some(self.head.clone());
            }
            self.save_checkpoint(improved)?;

            if let (Some(es), Some(_)) = (&early_stopping, val) {
                if self.state.epochs_without_improvement >= es.patience {
                    logger.log_early_stop(es.patience);
                    stopped_early = true;
                    break;
                }
            }
        }

        let (final_train_loss, final_train_accuracy) = self
            .state
            .last()
            .map(|m| (m.train_loss, m.train_accuracy))
            .unwrap_or((0.0, 0.0));

        let best = self
            .state
            .best_val_accuracy
            .unwrap_or(final_train_accuracy);
        logger.log_complete(self.state.epochs_run(), best);

        Ok(TrainingSummary {
            epochs_run: self.state.epochs_run(),
            best_epoch: self.state.best_epoch,
            best_val_accuracy: self.state.best_val_accuracy,
            final_train_loss,
            final_train_accuracy,
            stopped_early,
            duration_secs: start.elapsed().as_secs_f64(),
            history: self.state.history.clone(),
        })
    }

    fn save_checkpoint(&self, is_best: bool) -> Result<()> {
        let (Some((manager, metadata)), Some(last)) = (&self.checkpoints, self.state.last()) else {
            return Ok(());
        };

        let checkpoint = Checkpoint::new(
            last.epoch + 1,
            last.train_loss,
            last.train_accuracy,
            last.val_accuracy,
            metadata.clone(),
        );
        manager.save(&checkpoint, &self.head, is_best)
    }

    /// Release the extractor and the head to keep: the best-validation head
    /// when one was tracked, otherwise the last one.
    pub fn into_parts(self) -> (E, ClassifierHead<B>, TrainingState) {
        let head = self.best_head.unwrap_or(self.head);
        (self.extractor, head, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EarlyStoppingConfig;
    use crate::dataset::{ImageBatcher, ImageBurnDataset, ImageItem, Normalization};
    use crate::model::{ClassifierHeadConfig, ConvBackbone, ConvBackboneConfig};
    use crate::training::FeatureCache;
    use burn::backend::Autodiff;
    use burn::optim::{AdamConfig, SgdConfig};
    use burn_ndarray::NdArray;
    use rand::SeedableRng;

    type Inner = NdArray;
    type TestBackend = Autodiff<Inner>;

    fn names() -> Vec<String> {
        vec!["rural".to_string(), "urban".to_string()]
    }

    /// Two linearly separable clusters in a 4-d embedding space
    fn separable_features(n: usize) -> BatchSource {
        let mut features = Vec::with_capacity(n * 4);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let label = i % 2;
            let sign = if label == 0 { -1.0 } else { 1.0 };
            let jitter = (i as f32 * 0.37).sin() * 0.1;
            features.extend([sign + jitter, sign * 0.5, -sign, jitter]);
            labels.push(label);
        }
        BatchSource::Features(FeatureCache::from_parts(features, labels, 4).unwrap())
    }

    /// Small images: dark ones are rural, bright ones urban
    fn image_source(n: usize) -> BatchSource {
        let items = (0..n)
            .map(|i| {
                let label = i % 2;
                let value = if label == 0 { 0.1 } else { 0.9 };
                ImageItem {
                    image: vec![value; 3 * 8 * 8],
                    label,
                    path: format!("mem://{i}"),
                }
            })
            .collect();
        BatchSource::Images {
            dataset: ImageBurnDataset::from_items(items, 8),
            batcher: ImageBatcher::new(8, Normalization::Unit),
        }
    }

    /// Extractor that passes cached embeddings through unchanged
    #[derive(Clone, Debug)]
    struct Identity(usize);

    impl<B: Backend> FeatureExtractor<B> for Identity {
        fn extract(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
            let [b, c, h, w] = images.dims();
            Ok(images.reshape([b, c * h * w]))
        }

        fn feature_dim(&self) -> usize {
            self.0
        }
    }

    fn config(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            epochs,
            batch_size: 4,
            learning_rate: 0.1,
            log_interval: 100,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_epoch_batches_single_pass() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let batches = epoch_batches(10, 4, None, &mut rng);

        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].len(), 2);

        let mut all: Vec<usize> = batches.concat();
        all.sort();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_epoch_batches_respects_steps() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(epoch_batches(100, 10, Some(3), &mut rng).len(), 3);

        // more steps than one pass provides
        let batches = epoch_batches(5, 2, Some(7), &mut rng);
        assert_eq!(batches.len(), 7);
        assert!(batches.iter().all(|b| !b.is_empty()));

        assert!(epoch_batches(0, 2, Some(3), &mut rng).is_empty());
    }

    #[test]
    fn test_epoch_batches_deterministic() {
        let a = epoch_batches(20, 3, None, &mut ChaCha8Rng::seed_from_u64(7));
        let b = epoch_batches(20, 3, None, &mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_training_state_tracks_best() {
        let mut state = TrainingState::new();
        let epoch = |e: usize, acc: f64| EpochMetrics {
            epoch: e,
            train_loss: 0.5,
            train_accuracy: 0.5,
            val_loss: None,
            val_accuracy: Some(acc),
            batches: 1,
            samples: 1,
            duration_secs: 0.0,
        };

        assert!(state.record_epoch(epoch(0, 0.6), 0.0));
        assert!(state.record_epoch(epoch(1, 0.7), 0.0));
        assert!(!state.record_epoch(epoch(2, 0.7), 0.0));
        assert!(!state.record_epoch(epoch(3, 0.705), 0.01));

        assert_eq!(state.best_epoch, Some(1));
        assert_eq!(state.best_val_accuracy, Some(0.7));
        assert_eq!(state.epochs_without_improvement, 2);
        assert_eq!(state.epochs_run(), 4);
    }

    #[test]
    fn test_fit_learns_separable_features() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new(4).init::<TestBackend>(&device);
        let optimizer = SgdConfig::new().init();

        let mut trainer =
            Trainer::new(Identity(4), head, optimizer, config(15), names(), device).unwrap();

        let train = separable_features(32);
        let val = separable_features(16);
        let summary = trainer.fit(&train, Some(&val)).unwrap();

        assert_eq!(summary.epochs_run, 15);
        assert!(summary.final_train_loss.is_finite());
        assert!(summary.best_val_accuracy.unwrap() >= 0.9);
        assert!(summary.history[14].train_loss < summary.history[0].train_loss);
    }

    #[test]
    fn test_backbone_unchanged_by_training() {
        let device = Default::default();
        let backbone: ConvBackbone<Inner> = ConvBackboneConfig::new(vec![4, 6]).init(&device);
        let head = ClassifierHeadConfig::new(6).init::<TestBackend>(&device);
        let optimizer = AdamConfig::new().init();

        let input = Tensor::<Inner, 4>::ones([1, 3, 8, 8], &device);
        let before: Vec<f32> = backbone.extract(input.clone()).unwrap().into_data().convert::<f32>().to_vec().unwrap();

        let mut trainer =
            Trainer::new(backbone, head, optimizer, config(3), names(), device).unwrap();
        trainer.fit(&image_source(12), None).unwrap();

        let (backbone, _, state) = trainer.into_parts();
        let after: Vec<f32> = backbone.extract(input).unwrap().into_data().convert::<f32>().to_vec().unwrap();

        assert_eq!(state.epochs_run(), 3);
        assert_eq!(before, after);
    }

    #[test]
    fn test_steps_per_epoch_limits_batches() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new(4).init::<TestBackend>(&device);
        let mut cfg = config(1);
        cfg.steps_per_epoch = Some(2);

        let mut trainer =
            Trainer::new(Identity(4), head, SgdConfig::new().init(), cfg, names(), device).unwrap();
        let metrics = trainer.train_epoch(&separable_features(40), 0).unwrap();

        assert_eq!(metrics.batches, 2);
        assert_eq!(metrics.samples, 8);
    }

    #[test]
    fn test_validation_steps_bound_evaluation() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new(4).init::<TestBackend>(&device);
        let mut cfg = config(1);
        cfg.validation_steps = Some(2);

        let trainer =
            Trainer::new(Identity(4), head, SgdConfig::new().init(), cfg, names(), device).unwrap();
        let metrics = trainer.evaluate(&separable_features(40)).unwrap();

        assert_eq!(metrics.total_samples, 8);
        assert!(metrics.average_loss.is_some());
        assert_eq!(metrics.confusion_matrix.total(), 8);
    }

    /// Labels grouped by class, the order a folder scan produces
    fn folder_ordered_features(per_class: usize) -> BatchSource {
        let mut features = Vec::new();
        let mut labels = Vec::new();
        for label in 0..2 {
            let sign = if label == 0 { -1.0 } else { 1.0 };
            for i in 0..per_class {
                features.extend([sign, sign * 0.5, -sign, i as f32 * 0.01]);
                labels.push(label);
            }
        }
        BatchSource::Features(FeatureCache::from_parts(features, labels, 4).unwrap())
    }

    #[test]
    fn test_validation_subset_covers_both_classes() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new(4).init::<TestBackend>(&device);
        let mut cfg = config(1);
        cfg.validation_steps = Some(2);

        let trainer =
            Trainer::new(Identity(4), head, SgdConfig::new().init(), cfg, names(), device).unwrap();
        let val = folder_ordered_features(8);
        let metrics = trainer.evaluate(&val).unwrap();

        assert_eq!(metrics.total_samples, 8);
        assert!(metrics.confusion_matrix.row_total(0) > 0);
        assert!(metrics.confusion_matrix.row_total(1) > 0);

        // the same subset every time
        let again = trainer.evaluate(&val).unwrap();
        assert_eq!(again.confusion_matrix, metrics.confusion_matrix);
        assert_eq!(again.average_loss, metrics.average_loss);
    }

    #[test]
    fn test_validation_indices() {
        assert_eq!(validation_indices(5, 4, None, 1), vec![0, 1, 2, 3, 4]);
        assert_eq!(validation_indices(5, 4, Some(3), 1), vec![0, 1, 2, 3, 4]);

        let subset = validation_indices(16, 4, Some(2), 42);
        assert_eq!(subset.len(), 8);
        assert_eq!(subset, validation_indices(16, 4, Some(2), 42));
        assert!(subset.iter().any(|&i| i < 8) && subset.iter().any(|&i| i >= 8));

        let mut unique = subset.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 8);
    }

    #[test]
    fn test_early_stopping_halts_training() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new(4).init::<TestBackend>(&device);
        let mut cfg = config(50);
        cfg.early_stopping = Some(EarlyStoppingConfig {
            patience: 2,
            min_delta: 0.0,
        });

        let mut trainer =
            Trainer::new(Identity(4), head, SgdConfig::new().init(), cfg, names(), device).unwrap();
        // separable data reaches perfect accuracy quickly, then cannot improve
        let summary = trainer
            .fit(&separable_features(16), Some(&separable_features(8)))
            .unwrap();

        assert!(summary.stopped_early);
        assert!(summary.epochs_run < 50);
    }

    #[test]
    fn test_fit_writes_checkpoints() {
        let dir = tempfile::TempDir::new().unwrap();
        let device = Default::default();
        let head = ClassifierHeadConfig::new(4).init::<TestBackend>(&device);
        let metadata = CheckpointMetadata {
            backbone: "identity".to_string(),
            class_names: names(),
            trainable_params: 10,
            frozen_params: None,
            training_samples: 16,
        };

        let mut trainer =
            Trainer::new(Identity(4), head, SgdConfig::new().init(), config(4), names(), device)
                .unwrap()
                .with_checkpoints(CheckpointManager::new(dir.path(), 2), metadata);
        trainer
            .fit(&separable_features(16), Some(&separable_features(8)))
            .unwrap();

        let manager = CheckpointManager::new(dir.path(), 2);
        assert_eq!(manager.list_epochs().unwrap(), vec![3, 4]);
        assert_eq!(manager.load_latest().unwrap().epoch, 4);
        assert!(manager.load_best().unwrap().val_accuracy.is_some());
    }

    #[test]
    fn test_mismatched_dimensions_rejected() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new(8).init::<TestBackend>(&device);
        let result = Trainer::new(Identity(4), head, SgdConfig::new().init(), config(1), names(), device);
        assert!(matches!(result, Err(TransferError::Model(_))));
    }

    #[test]
    fn test_empty_source_is_an_error() {
        let device = Default::default();
        let head = ClassifierHeadConfig::new(4).init::<TestBackend>(&device);
        let mut trainer =
            Trainer::new(Identity(4), head, SgdConfig::new().init(), config(1), names(), device).unwrap();

        let empty = BatchSource::Features(FeatureCache::from_parts(Vec::new(), Vec::new(), 4).unwrap());
        assert!(trainer.train_epoch(&empty, 0).is_err());
    }
}
