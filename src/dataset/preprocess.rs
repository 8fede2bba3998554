//! Image preprocessing: decode, resize, CHW layout and normalization.
//!
//! Pretrained backbones expect the pixel statistics they were trained
//! with, so the same [`Normalization`] must be applied at training,
//! evaluation and prediction time.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::prelude::*;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, TransferError};

/// ImageNet per-channel mean (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet per-channel standard deviation (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
/// Caffe-style ImageNet mean on the 0..255 scale, BGR order
pub const CAFFE_MEAN_BGR: [f32; 3] = [103.939, 116.779, 123.68];

/// Pixel normalization applied after scaling to `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// `(x - mean) / std` with ImageNet statistics (ResNet family)
    #[default]
    ImageNet,
    /// Maps `[0, 1]` to `[-1, 1]` (Xception/Inception family)
    Symmetric,
    /// Keras ResNet50: RGB to BGR, then the 0..255 BGR mean subtracted, no scaling
    Caffe,
    /// Leaves values in `[0, 1]`
    Unit,
}

impl Normalization {
    /// Per-channel `(mean, std)` equivalent of this normalization, applied
    /// to `[0, 1]` inputs after any channel reordering
    pub fn mean_std(&self) -> ([f32; 3], [f32; 3]) {
        match self {
            Normalization::ImageNet => (IMAGENET_MEAN, IMAGENET_STD),
            Normalization::Symmetric => ([0.5; 3], [0.5; 3]),
            Normalization::Caffe => (CAFFE_MEAN_BGR.map(|m| m / 255.0), [1.0 / 255.0; 3]),
            Normalization::Unit => ([0.0; 3], [1.0; 3]),
        }
    }

    /// Whether channels are fed in BGR order
    pub fn swaps_channels(&self) -> bool {
        matches!(self, Normalization::Caffe)
    }

    /// Normalize a CHW buffer in place
    pub fn apply_chw(&self, data: &mut [f32]) {
        let (mean, std) = self.mean_std();
        let plane = data.len() / 3;
        if self.swaps_channels() && plane > 0 {
            let (red, rest) = data.split_at_mut(plane);
            red.swap_with_slice(&mut rest[plane..2 * plane]);
        }
        for (c, channel) in data.chunks_mut(plane.max(1)).take(3).enumerate() {
            for v in channel {
                *v = (*v - mean[c]) / std[c];
            }
        }
    }

    /// Normalize a `[batch, 3, h, w]` tensor
    pub fn apply_tensor<B: Backend>(&self, images: Tensor<B, 4>, device: &B::Device) -> Tensor<B, 4> {
        if *self == Normalization::Unit {
            return images;
        }

        let images = match self.swaps_channels() {
            true => images.flip([1]),
            false => images,
        };
        let (mean, std) = self.mean_std();
        let mean = Tensor::<B, 4>::from_floats(TensorData::new(mean.to_vec(), [1, 3, 1, 1]), device);
        let std = Tensor::<B, 4>::from_floats(TensorData::new(std.to_vec(), [1, 3, 1, 1]), device);

        (images - mean) / std
    }
}

impl fmt::Display for Normalization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Normalization::ImageNet => write!(f, "imagenet"),
            Normalization::Symmetric => write!(f, "symmetric"),
            Normalization::Caffe => write!(f, "caffe"),
            Normalization::Unit => write!(f, "unit"),
        }
    }
}

impl FromStr for Normalization {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "imagenet" => Ok(Normalization::ImageNet),
            "symmetric" | "tf" => Ok(Normalization::Symmetric),
            "caffe" => Ok(Normalization::Caffe),
            "unit" | "none" => Ok(Normalization::Unit),
            other => Err(TransferError::InvalidInput(format!(
                "Unknown normalization '{}'",
                other
            ))),
        }
    }
}

/// Decode an image from disk
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .map_err(|e| TransferError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .with_guessed_format()
        .map_err(|e| TransferError::ImageLoad(path.to_path_buf(), e.to_string()))?
        .decode()
        .map_err(|e| TransferError::ImageLoad(path.to_path_buf(), e.to_string()))
}

/// Resize to a square `size x size`, ignoring aspect ratio
pub fn resize_exact(img: &DynamicImage, size: usize) -> DynamicImage {
    img.resize_exact(size as u32, size as u32, FilterType::Triangle)
}

/// Convert to a CHW float buffer with values in `[0, 1]`
pub fn to_chw(img: &DynamicImage) -> Vec<f32> {
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (i, pixel) in rgb.pixels().enumerate() {
        data[i] = pixel[0] as f32 / 255.0;
        data[plane + i] = pixel[1] as f32 / 255.0;
        data[2 * plane + i] = pixel[2] as f32 / 255.0;
    }

    data
}

/// Load, resize and convert an image to CHW `[0, 1]` floats
pub fn load_chw(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = load_image(path)?;
    Ok(to_chw(&resize_exact(&img, size)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};

    type TestBackend = NdArray;

    fn solid(r: u8, g: u8, b: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([r, g, b])))
    }

    #[test]
    fn test_to_chw_layout() {
        let data = to_chw(&solid(255, 0, 51));
        assert_eq!(data.len(), 3 * 16);
        assert!(data[..16].iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert!(data[16..32].iter().all(|&v| v == 0.0));
        assert!(data[32..].iter().all(|&v| (v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn test_symmetric_maps_to_unit_interval() {
        let mut data = to_chw(&solid(255, 0, 0));
        Normalization::Symmetric.apply_chw(&mut data);
        assert!((data[0] - 1.0).abs() < 1e-6);
        assert!((data[16] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_imagenet_centers_mean_pixel() {
        let mut data = vec![0.485f32, 0.456, 0.406];
        Normalization::ImageNet.apply_chw(&mut data);
        assert!(data.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn test_caffe_swaps_to_bgr_and_subtracts_mean() {
        // the BGR mean pixel, stored as RGB
        let mut data = vec![123.68 / 255.0, 116.779 / 255.0, 103.939 / 255.0];
        Normalization::Caffe.apply_chw(&mut data);
        assert!(data.iter().all(|v| v.abs() < 1e-3));

        let mut data = to_chw(&solid(255, 0, 0));
        Normalization::Caffe.apply_chw(&mut data);
        // red lands in the last plane on the 0..255 scale
        assert!((data[0] + 103.939).abs() < 1e-3);
        assert!((data[32] - (255.0 - 123.68)).abs() < 1e-3);
    }

    #[test]
    fn test_tensor_and_buffer_normalization_agree() {
        let device = Default::default();
        let raw = to_chw(&solid(10, 120, 240));

        for normalization in [Normalization::ImageNet, Normalization::Caffe] {
            let mut expected = raw.clone();
            normalization.apply_chw(&mut expected);

            let tensor =
                Tensor::<TestBackend, 4>::from_floats(TensorData::new(raw.clone(), [1, 3, 4, 4]), &device);
            let actual: Vec<f32> = normalization
                .apply_tensor(tensor, &device)
                .into_data()
                .convert::<f32>()
                .to_vec()
                .unwrap();

            for (a, e) in actual.iter().zip(expected.iter()) {
                assert!((a - e).abs() < 1e-3, "{normalization}: {a} vs {e}");
            }
        }
    }

    #[test]
    fn test_parse_normalization() {
        assert_eq!("ImageNet".parse::<Normalization>().unwrap(), Normalization::ImageNet);
        assert_eq!("tf".parse::<Normalization>().unwrap(), Normalization::Symmetric);
        assert_eq!("Caffe".parse::<Normalization>().unwrap(), Normalization::Caffe);
        assert!("bogus".parse::<Normalization>().is_err());
    }

    #[test]
    fn test_resize_exact() {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(30, 10, Rgb([1, 2, 3])));
        let resized = resize_exact(&img, 8);
        assert_eq!((resized.width(), resized.height()), (8, 8));
    }
}
