//! Burn `Dataset` and `Batcher` implementations
//!
//! - `ImageBatcher`: resized images, no augmentation (validation, feature caching)
//! - `AugmentingBatcher`: raw images augmented per batch (training)
//!
//! Both datasets either decode on every `get` or hold everything in memory.
//! Cached raw images are stored at the model resolution, so memory stays
//! bounded by `len * image_size^2` whatever the source files are.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use image::DynamicImage;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::augmentation::{AugmentationConfig, Augmenter};
use super::preprocess::{load_chw, load_image, resize_exact, Normalization};
use crate::utils::error::Result;
use crate::utils::{seeded_rng, RngStream};

/// A preprocessed image ready for batching
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageItem {
    /// Flattened CHW floats in `[0, 1]`, length `3 * size * size`
    pub image: Vec<f32>,
    /// Class label
    pub label: usize,
    /// Source path, for logging
    pub path: String,
}

impl ImageItem {
    /// Load, resize and convert an image
    pub fn from_path(path: &Path, label: usize, image_size: usize) -> Result<Self> {
        Ok(Self {
            image: load_chw(path, image_size)?,
            label,
            path: path.to_string_lossy().to_string(),
        })
    }
}

/// A decoded, not yet normalized image kept for on-the-fly augmentation
#[derive(Clone)]
pub struct RawImageItem {
    pub image: DynamicImage,
    pub label: usize,
    pub path: String,
}

impl RawImageItem {
    pub fn from_path(path: &Path, label: usize) -> Result<Self> {
        Ok(Self {
            image: load_image(path)?,
            label,
            path: path.to_string_lossy().to_string(),
        })
    }

    /// Decode and shrink to `image_size x image_size`
    pub fn from_path_resized(path: &Path, label: usize, image_size: usize) -> Result<Self> {
        let item = Self::from_path(path, label)?;
        Ok(Self {
            image: resize_exact(&item.image, image_size),
            ..item
        })
    }
}

impl std::fmt::Debug for RawImageItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImageItem")
            .field("label", &self.label)
            .field("path", &self.path)
            .field(
                "image_size",
                &format!("{}x{}", self.image.width(), self.image.height()),
            )
            .finish()
    }
}

fn loading_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        .map(|s| s.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Decode every sample in parallel, failing on the first unreadable file
fn load_all<T, F>(samples: &[(PathBuf, usize)], what: &str, load: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&Path, usize) -> Result<T> + Sync,
{
    info!("Pre-loading {} {} (parallel)", samples.len(), what);
    let pb = loading_bar(samples.len());
    let loaded = AtomicUsize::new(0);

    let items = samples
        .par_iter()
        .map(|(path, label)| {
            let item = load(path, *label);
            let count = loaded.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 50 == 0 {
                pb.set_position(count as u64);
            }
            item
        })
        .collect::<Result<Vec<_>>>();

    pb.finish_and_clear();
    let items = items?;
    info!("Loaded {} {}", items.len(), what);

    Ok(items)
}

/// Images fed to the augmenting batcher, decoded lazily or cached
#[derive(Clone)]
pub struct RawImageDataset {
    samples: Vec<(PathBuf, usize)>,
    cached_items: Option<Vec<RawImageItem>>,
}

impl std::fmt::Debug for RawImageDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawImageDataset")
            .field("len", &self.len())
            .field("cached", &self.is_cached())
            .finish()
    }
}

impl RawImageDataset {
    /// Lazy dataset: images are decoded at full size on each `get`
    pub fn new(samples: Vec<(PathBuf, usize)>) -> Self {
        Self {
            samples,
            cached_items: None,
        }
    }

    /// Decode every image up front, stored at `image_size x image_size`.
    ///
    /// Augmentation shifts are fractions of the image extent, so they act
    /// the same on the downscaled copy.
    pub fn new_cached(samples: Vec<(PathBuf, usize)>, image_size: usize) -> Result<Self> {
        let items = load_all(&samples, "raw images", |path, label| {
            RawImageItem::from_path_resized(path, label, image_size)
        })?;

        Ok(Self {
            samples,
            cached_items: Some(items),
        })
    }

    pub fn from_items(items: Vec<RawImageItem>) -> Self {
        let samples = items
            .iter()
            .map(|item| (PathBuf::from(&item.path), item.label))
            .collect();

        Self {
            samples,
            cached_items: Some(items),
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached_items.is_some()
    }
}

impl Dataset<RawImageItem> for RawImageDataset {
    fn get(&self, index: usize) -> Option<RawImageItem> {
        if let Some(ref cached) = self.cached_items {
            return cached.get(index).cloned();
        }

        let (path, label) = self.samples.get(index)?;
        match RawImageItem::from_path(path, *label) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping unreadable image: {}", e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Resized images, loaded lazily or cached up front
#[derive(Debug, Clone)]
pub struct ImageBurnDataset {
    samples: Vec<(PathBuf, usize)>,
    image_size: usize,
    cached_items: Option<Vec<ImageItem>>,
}

impl ImageBurnDataset {
    /// Lazy dataset: images are decoded on each `get`
    pub fn new(samples: Vec<(PathBuf, usize)>, image_size: usize) -> Self {
        Self {
            samples,
            image_size,
            cached_items: None,
        }
    }

    /// Decode and resize every image up front
    pub fn new_cached(samples: Vec<(PathBuf, usize)>, image_size: usize) -> Result<Self> {
        let items = load_all(&samples, "images", |path, label| {
            ImageItem::from_path(path, label, image_size)
        })?;

        Ok(Self {
            samples,
            image_size,
            cached_items: Some(items),
        })
    }

    /// Build from already preprocessed items
    pub fn from_items(items: Vec<ImageItem>, image_size: usize) -> Self {
        let samples = items
            .iter()
            .map(|item| (PathBuf::from(&item.path), item.label))
            .collect();

        Self {
            samples,
            image_size,
            cached_items: Some(items),
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn is_cached(&self) -> bool {
        self.cached_items.is_some()
    }

    /// Labels in dataset order
    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|(_, label)| *label).collect()
    }
}

impl Dataset<ImageItem> for ImageBurnDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        if let Some(ref cached) = self.cached_items {
            return cached.get(index).cloned();
        }

        let (path, label) = self.samples.get(index)?;
        match ImageItem::from_path(path, *label, self.image_size) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping unreadable image: {}", e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of images and their labels
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// Shape `[batch_size, 3, height, width]`, normalized
    pub images: Tensor<B, 4>,
    /// Shape `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
}

fn build_batch<B: Backend>(
    images_data: Vec<f32>,
    targets_data: Vec<i64>,
    image_size: usize,
    normalization: Normalization,
    device: &B::Device,
) -> ImageBatch<B> {
    let batch_size = targets_data.len();

    let images = Tensor::<B, 4>::from_floats(
        TensorData::new(images_data, [batch_size, 3, image_size, image_size]),
        device,
    );
    let images = normalization.apply_tensor(images, device);

    let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

    ImageBatch { images, targets }
}

/// Batcher for preprocessed items
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    image_size: usize,
    normalization: Normalization,
}

impl ImageBatcher {
    pub fn new(image_size: usize, normalization: Normalization) -> Self {
        Self {
            image_size,
            normalization,
        }
    }
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let targets_data: Vec<i64> = items.iter().map(|item| item.label as i64).collect();
        let images_data: Vec<f32> = items.into_iter().flat_map(|item| item.image).collect();

        build_batch(
            images_data,
            targets_data,
            self.image_size,
            self.normalization,
            device,
        )
    }
}

/// Batcher that augments raw images on the fly.
///
/// Each call derives its RNG from the base seed and a batch counter on the
/// augmentation stream, so a run with the same seed sees the same
/// augmentations and they never replay the shuffle draws.
pub struct AugmentingBatcher {
    augmenter: Augmenter,
    normalization: Normalization,
    image_size: usize,
    seed: u64,
    batches: AtomicU64,
}

impl Clone for AugmentingBatcher {
    fn clone(&self) -> Self {
        Self {
            augmenter: self.augmenter.clone(),
            normalization: self.normalization,
            image_size: self.image_size,
            seed: self.seed,
            batches: AtomicU64::new(self.batches.load(Ordering::Relaxed)),
        }
    }
}

impl std::fmt::Debug for AugmentingBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AugmentingBatcher")
            .field("image_size", &self.image_size)
            .field("config", self.augmenter.config())
            .finish()
    }
}

impl AugmentingBatcher {
    pub fn new(
        config: AugmentationConfig,
        image_size: usize,
        normalization: Normalization,
        seed: u64,
    ) -> Self {
        Self {
            augmenter: Augmenter::new(config, image_size),
            normalization,
            image_size,
            seed,
            batches: AtomicU64::new(0),
        }
    }
}

impl<B: Backend> Batcher<B, RawImageItem, ImageBatch<B>> for AugmentingBatcher {
    fn batch(&self, items: Vec<RawImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_index = self.batches.fetch_add(1, Ordering::Relaxed);
        let mut rng = seeded_rng(self.seed, RngStream::Augment, batch_index);

        let mut images_data = Vec::with_capacity(items.len() * 3 * self.image_size * self.image_size);
        let mut targets_data = Vec::with_capacity(items.len());

        for item in items {
            images_data.extend(self.augmenter.preprocess(item.image, Some(&mut rng)));
            targets_data.push(item.label as i64);
        }

        build_batch(
            images_data,
            targets_data,
            self.image_size,
            self.normalization,
            device,
        )
    }
}
