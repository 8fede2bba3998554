//! Convolutional backbone stored as a Burn record.
//!
//! Used for the `compact` preset, for custom stage widths and by tests.
//! Records are written with [`CompactRecorder`]; paths passed around here
//! are record bases and the recorder adds its own extension.

use std::path::{Path, PathBuf};

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    record::{CompactRecorder, FileRecorder},
    tensor::{backend::Backend, Tensor},
};
use tracing::info;

use super::backbone::FeatureExtractor;
use crate::utils::error::{Result, TransferError};

/// Stage widths of the `compact` preset
pub const COMPACT_STAGES: [usize; 3] = [32, 64, 128];

/// Configuration of a convolutional backbone
#[derive(Config, Debug)]
pub struct ConvBackboneConfig {
    /// Output channels of each stage; each stage halves the resolution
    pub stage_filters: Vec<usize>,

    /// Number of input channels (3 for RGB)
    #[config(default = "3")]
    pub in_channels: usize,

    #[config(default = "3")]
    pub kernel_size: usize,
}

impl ConvBackboneConfig {
    pub fn compact() -> Self {
        Self::new(COMPACT_STAGES.to_vec())
    }

    pub fn feature_dim(&self) -> usize {
        self.stage_filters.last().copied().unwrap_or(self.in_channels)
    }

    /// Smallest input side that survives every pooling stage
    pub fn min_input_size(&self) -> usize {
        1 << self.stage_filters.len()
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage_filters.is_empty() {
            return Err(TransferError::Config(
                "Backbone needs at least one stage".to_string(),
            ));
        }
        if self.stage_filters.contains(&0) || self.kernel_size == 0 {
            return Err(TransferError::Config(
                "Backbone stage widths and kernel size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Randomly initialized backbone
    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvBackbone<B> {
        let mut in_channels = self.in_channels;
        let stages = self
            .stage_filters
            .iter()
            .map(|&out_channels| {
                let stage = ConvStage::new(in_channels, out_channels, self.kernel_size, device);
                in_channels = out_channels;
                stage
            })
            .collect();

        ConvBackbone {
            stages,
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            feature_dim: self.feature_dim(),
        }
    }
}

/// Conv2d, BatchNorm, ReLU and a 2x2 max-pool
#[derive(Module, Debug)]
pub struct ConvStage<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: MaxPool2d,
}

impl<B: Backend> ConvStage<B> {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Same)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);
        self.pool.forward(x)
    }
}

/// Convolutional backbone ending in global average pooling
#[derive(Module, Debug)]
pub struct ConvBackbone<B: Backend> {
    pub stages: Vec<ConvStage<B>>,
    pub global_pool: AdaptiveAvgPool2d,
    feature_dim: usize,
}

impl<B: Backend> ConvBackbone<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .stages
            .iter()
            .fold(images, |x, stage| stage.forward(x));

        let x = self.global_pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }

    /// Stop every parameter from tracking gradients
    pub fn freeze(self) -> Self {
        self.no_grad()
    }
}

impl<B: Backend> FeatureExtractor<B> for ConvBackbone<B> {
    fn extract(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        Ok(self.forward(images))
    }

    fn feature_dim(&self) -> usize {
        self.feature_dim
    }
}

/// File the recorder writes for `base`
pub fn record_file<B: Backend>(base: &Path) -> PathBuf {
    base.with_extension(<CompactRecorder as FileRecorder<B>>::file_extension())
}

/// Accept a record path with or without the recorder's extension
pub fn record_base_path<B: Backend>(path: &Path) -> PathBuf {
    let extension = <CompactRecorder as FileRecorder<B>>::file_extension();
    match path.extension() {
        Some(ext) if ext == extension => path.with_extension(""),
        _ => path.to_path_buf(),
    }
}

/// Load backbone weights from a record and freeze them
pub fn load_conv_backbone<B: Backend>(
    config: &ConvBackboneConfig,
    path: &Path,
    device: &B::Device,
) -> Result<ConvBackbone<B>> {
    config.validate()?;

    let base = record_base_path::<B>(path);
    let on_disk = record_file::<B>(&base);
    if !on_disk.exists() {
        return Err(TransferError::PathNotFound(on_disk));
    }

    let backbone = config
        .init::<B>(device)
        .load_file(&base, &CompactRecorder::new(), device)
        .map_err(|e| TransferError::Model(format!("Failed to load backbone weights: {:?}", e)))?;

    info!(
        "Loaded backbone from {:?} ({} parameters, {}-d features)",
        on_disk,
        backbone.num_params(),
        backbone.feature_dim
    );

    Ok(backbone.freeze())
}

/// Write a backbone record at `path`, returning the file actually written
pub fn save_conv_backbone<B: Backend>(backbone: &ConvBackbone<B>, path: &Path) -> Result<PathBuf> {
    let base = record_base_path::<B>(path);
    if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    backbone
        .clone()
        .save_file(&base, &CompactRecorder::new())
        .map_err(|e| TransferError::Model(format!("Failed to save backbone weights: {:?}", e)))?;

    Ok(record_file::<B>(&base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn tiny_config() -> ConvBackboneConfig {
        ConvBackboneConfig::new(vec![4, 6])
    }

    fn features(backbone: &ConvBackbone<TestBackend>, input: Tensor<TestBackend, 4>) -> Vec<f32> {
        backbone.forward(input).into_data().convert::<f32>().to_vec().unwrap()
    }

    #[test]
    fn test_backbone_output_shape() {
        let device = Default::default();
        let backbone = tiny_config().init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::zeros([2, 3, 16, 16], &device);
        let features = backbone.extract(input).unwrap();

        assert_eq!(features.dims(), [2, 6]);
        assert_eq!(FeatureExtractor::<TestBackend>::feature_dim(&backbone), 6);
        assert_eq!(ConvBackboneConfig::compact().feature_dim(), 128);
    }

    #[test]
    fn test_min_input_size_and_validation() {
        assert_eq!(tiny_config().min_input_size(), 4);
        assert!(ConvBackboneConfig::new(vec![]).validate().is_err());
        assert!(ConvBackboneConfig::new(vec![8, 0]).validate().is_err());
        assert!(tiny_config().validate().is_ok());
    }

    #[test]
    fn test_record_paths_use_recorder_extension() {
        assert_eq!(
            record_file::<TestBackend>(Path::new("w/backbone")),
            PathBuf::from("w/backbone.mpk")
        );
        assert_eq!(
            record_base_path::<TestBackend>(Path::new("w/backbone.mpk")),
            PathBuf::from("w/backbone")
        );
        assert_eq!(
            record_base_path::<TestBackend>(Path::new("w/backbone")),
            PathBuf::from("w/backbone")
        );
    }

    #[test]
    fn test_save_then_load_gives_same_features() {
        let device = Default::default();
        let dir = TempDir::new().unwrap();
        let config = tiny_config();
        let backbone = config.init::<TestBackend>(&device);

        let written = save_conv_backbone(&backbone, &dir.path().join("backbone")).unwrap();
        assert_eq!(written, dir.path().join("backbone.mpk"));
        assert!(written.exists());

        // both the written file and its base name load
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 8, 8], &device);
        let expected = features(&backbone, input.clone());
        for path in [written.clone(), dir.path().join("backbone")] {
            let loaded = load_conv_backbone::<TestBackend>(&config, &path, &device).unwrap();
            let actual = features(&loaded, input.clone());

            // the record stores half precision
            for (a, e) in actual.iter().zip(expected.iter()) {
                assert!((a - e).abs() <= 1e-2 * (1.0 + e.abs()));
            }
        }
    }

    #[test]
    fn test_missing_weights_is_error() {
        let device = Default::default();
        let result = load_conv_backbone::<TestBackend>(&tiny_config(), Path::new("/no/such/backbone"), &device);
        assert!(matches!(result, Err(TransferError::PathNotFound(p)) if p.ends_with("backbone.mpk")));
    }
}
