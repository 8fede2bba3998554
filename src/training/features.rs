//! Turning image batches into backbone embeddings.
//!
//! The head only ever sees `[batch, feature_dim]` embeddings. They come from
//! one of three places: preprocessed images run through the backbone,
//! freshly augmented images run through the backbone, or a cache filled by
//! running the backbone once over the whole dataset. The cache is only
//! sound because the backbone never changes during training.

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor, TensorData},
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::dataset::{
    AugmentingBatcher, ImageBatch, ImageBatcher, ImageBurnDataset, ImageItem, RawImageDataset,
    RawImageItem,
};
use crate::model::FeatureExtractor;
use crate::utils::error::{Result, TransferError};

/// Embeddings and labels for one batch
#[derive(Clone, Debug)]
pub struct FeatureBatch<B: Backend> {
    /// Shape `[batch_size, feature_dim]`
    pub features: Tensor<B, 2>,
    /// Shape `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
}

/// Where training or validation batches come from
#[derive(Debug)]
pub enum BatchSource {
    /// Preprocessed images, run through the backbone every time
    Images {
        dataset: ImageBurnDataset,
        batcher: ImageBatcher,
    },
    /// Raw images, augmented per batch before the backbone
    Augmented {
        dataset: RawImageDataset,
        batcher: AugmentingBatcher,
    },
    /// Embeddings computed once up front
    Features(FeatureCache),
}

impl BatchSource {
    pub fn len(&self) -> usize {
        match self {
            BatchSource::Images { dataset, .. } => dataset.len(),
            BatchSource::Augmented { dataset, .. } => dataset.len(),
            BatchSource::Features(cache) => cache.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short description for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            BatchSource::Images { .. } => "images",
            BatchSource::Augmented { .. } => "augmented images",
            BatchSource::Features(_) => "cached features",
        }
    }
}

/// Build the embedding batch for `indices`.
///
/// Returns `Ok(None)` when none of the indexed samples could be loaded and
/// an error when the backbone itself fails.
pub fn extract_batch<B, E>(
    extractor: &E,
    source: &BatchSource,
    indices: &[usize],
    device: &B::Device,
) -> Result<Option<FeatureBatch<B>>>
where
    B: Backend,
    E: FeatureExtractor<B>,
{
    match source {
        BatchSource::Images { dataset, batcher } => {
            image_features(extractor, dataset, batcher, indices, device)
        }
        BatchSource::Augmented { dataset, batcher } => {
            let items: Vec<RawImageItem> = indices.iter().filter_map(|&i| dataset.get(i)).collect();
            if items.is_empty() {
                return Ok(None);
            }
            let batch: ImageBatch<B> = batcher.batch(items, device);
            Ok(Some(FeatureBatch {
                features: extractor.extract(batch.images)?,
                targets: batch.targets,
            }))
        }
        BatchSource::Features(cache) => Ok(cache.batch(indices, device)),
    }
}

fn image_features<B, E>(
    extractor: &E,
    dataset: &ImageBurnDataset,
    batcher: &ImageBatcher,
    indices: &[usize],
    device: &B::Device,
) -> Result<Option<FeatureBatch<B>>>
where
    B: Backend,
    E: FeatureExtractor<B>,
{
    let items: Vec<ImageItem> = indices.iter().filter_map(|&i| dataset.get(i)).collect();
    if items.is_empty() {
        return Ok(None);
    }
    let batch: ImageBatch<B> = batcher.batch(items, device);
    Ok(Some(FeatureBatch {
        features: extractor.extract(batch.images)?,
        targets: batch.targets,
    }))
}

/// Backbone embeddings for a whole dataset, kept on the host
#[derive(Clone, Debug)]
pub struct FeatureCache {
    features: Vec<f32>,
    labels: Vec<i64>,
    feature_dim: usize,
}

impl FeatureCache {
    /// Run `extractor` once over every loadable image in `dataset`
    pub fn build<B, E>(
        extractor: &E,
        dataset: &ImageBurnDataset,
        batcher: &ImageBatcher,
        batch_size: usize,
        device: &B::Device,
    ) -> Result<Self>
    where
        B: Backend,
        E: FeatureExtractor<B>,
    {
        let feature_dim = extractor.feature_dim();
        let len = dataset.len();

        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} embeddings")
                .map_err(|e| TransferError::Training(format!("Invalid progress template: {}", e)))?
                .progress_chars("#>-"),
        );

        let mut features = Vec::with_capacity(len * feature_dim);
        let mut labels = Vec::with_capacity(len);

        let indices: Vec<usize> = (0..len).collect();

        for chunk in indices.chunks(batch_size.max(1)) {
            pb.inc(chunk.len() as u64);
            let Some(batch) = image_features::<B, E>(extractor, dataset, batcher, chunk, device)? else {
                continue;
            };

            let batch_features = batch
                .features
                .into_data()
                .convert::<f32>()
                .to_vec::<f32>()
                .map_err(|e| TransferError::Training(format!("Failed to read features: {:?}", e)))?;
            let batch_labels = batch
                .targets
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .map_err(|e| TransferError::Training(format!("Failed to read labels: {:?}", e)))?;

            features.extend(batch_features);
            labels.extend(batch_labels);
        }
        pb.finish_and_clear();

        if labels.is_empty() {
            return Err(TransferError::Training(
                "No images could be loaded to build the feature cache".to_string(),
            ));
        }

        info!(
            "Cached {} embeddings of width {} ({} skipped)",
            labels.len(),
            feature_dim,
            len - labels.len()
        );

        Ok(Self {
            features,
            labels,
            feature_dim,
        })
    }

    /// Cache from precomputed rows, one `feature_dim` slice per label
    pub fn from_parts(features: Vec<f32>, labels: Vec<usize>, feature_dim: usize) -> Result<Self> {
        if feature_dim == 0 || features.len() != labels.len() * feature_dim {
            return Err(TransferError::InvalidInput(format!(
                "{} values do not form {} rows of width {}",
                features.len(),
                labels.len(),
                feature_dim
            )));
        }

        Ok(Self {
            features,
            labels: labels.into_iter().map(|l| l as i64).collect(),
            feature_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    /// Gather cached rows into a batch; out-of-range indices are skipped
    pub fn batch<B: Backend>(&self, indices: &[usize], device: &B::Device) -> Option<FeatureBatch<B>> {
        let dim = self.feature_dim;
        let mut features = Vec::with_capacity(indices.len() * dim);
        let mut targets = Vec::with_capacity(indices.len());

        for &i in indices {
            if let Some(&label) = self.labels.get(i) {
                features.extend_from_slice(&self.features[i * dim..(i + 1) * dim]);
                targets.push(label);
            }
        }

        if targets.is_empty() {
            return None;
        }

        let n = targets.len();
        Some(FeatureBatch {
            features: Tensor::<B, 2>::from_floats(TensorData::new(features, [n, dim]), device),
            targets: Tensor::<B, 1, Int>::from_data(TensorData::new(targets, [n]), device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Normalization;
    use crate::model::ConvBackboneConfig;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn tiny_dataset(n: usize) -> ImageBurnDataset {
        let items = (0..n)
            .map(|i| ImageItem {
                image: vec![i as f32 / n as f32; 3 * 8 * 8],
                label: i % 2,
                path: format!("mem://{i}"),
            })
            .collect();
        ImageBurnDataset::from_items(items, 8)
    }

    #[test]
    fn test_cache_matches_direct_extraction() {
        let device = Default::default();
        let backbone = ConvBackboneConfig::new(vec![4, 6]).init::<TestBackend>(&device);
        let dataset = tiny_dataset(5);
        let batcher = ImageBatcher::new(8, Normalization::Unit);

        let cache = FeatureCache::build::<TestBackend, _>(&backbone, &dataset, &batcher, 2, &device).unwrap();
        assert_eq!(cache.len(), 5);
        assert_eq!(cache.feature_dim(), 6);

        let source = BatchSource::Images { dataset, batcher };
        let direct = extract_batch::<TestBackend, _>(&backbone, &source, &[3, 1], &device)
            .unwrap()
            .unwrap();
        let cached = cache.batch::<TestBackend>(&[3, 1], &device).unwrap();

        let a: Vec<f32> = direct.features.into_data().convert::<f32>().to_vec().unwrap();
        let b: Vec<f32> = cached.features.into_data().convert::<f32>().to_vec().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }

        let labels: Vec<i64> = cached.targets.into_data().convert::<i64>().to_vec().unwrap();
        assert_eq!(labels, vec![1, 1]);
    }

    #[test]
    fn test_cache_batch_skips_out_of_range() {
        let device = Default::default();
        let cache = FeatureCache::from_parts(vec![1.0, 2.0, 3.0, 4.0], vec![0, 1], 2).unwrap();

        let batch = cache.batch::<TestBackend>(&[1, 7], &device).unwrap();
        assert_eq!(batch.features.dims(), [1, 2]);
        assert!(cache.batch::<TestBackend>(&[9], &device).is_none());
    }

    #[test]
    fn test_from_parts_rejects_ragged_rows() {
        assert!(FeatureCache::from_parts(vec![1.0, 2.0, 3.0], vec![0, 1], 2).is_err());
    }

    #[test]
    fn test_source_len() {
        let source = BatchSource::Features(FeatureCache::from_parts(vec![0.0; 6], vec![0, 1, 0], 2).unwrap());
        assert_eq!(source.len(), 3);
        assert_eq!(source.kind(), "cached features");
        assert!(!source.is_empty());
    }
}
