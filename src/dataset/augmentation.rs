//! Training-time augmentation
//!
//! Random horizontal flips plus random width/height shifts. Shifted-in
//! pixels replicate the nearest edge. Validation and prediction never
//! augment.

use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::preprocess::{resize_exact, to_chw};
use crate::utils::error::{Result, TransferError};

/// Configuration for data augmentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Probability of a horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f32,
    /// Maximum horizontal shift as a fraction of the width
    pub width_shift_range: f32,
    /// Maximum vertical shift as a fraction of the height
    pub height_shift_range: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
        }
    }
}

impl AugmentationConfig {
    /// Flips only, no shifting
    pub fn flip_only() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
        }
    }

    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            horizontal_flip_prob: 0.0,
            width_shift_range: 0.0,
            height_shift_range: 0.0,
        }
    }

    /// Whether any augmentation can change an image
    pub fn is_enabled(&self) -> bool {
        self.horizontal_flip_prob > 0.0 || self.width_shift_range > 0.0 || self.height_shift_range > 0.0
    }

    /// Resolve a preset name (`none`, `flip`, `default`)
    pub fn preset(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "none" | "off" => Ok(Self::none()),
            "flip" | "flip_only" => Ok(Self::flip_only()),
            "default" | "shift" => Ok(Self::default()),
            other => Err(TransferError::InvalidInput(format!(
                "Unknown augmentation preset '{}'",
                other
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.horizontal_flip_prob) {
            return Err(TransferError::Config(format!(
                "horizontal_flip_prob must be in [0, 1], got {}",
                self.horizontal_flip_prob
            )));
        }
        for (name, value) in [
            ("width_shift_range", self.width_shift_range),
            ("height_shift_range", self.height_shift_range),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(TransferError::Config(format!(
                    "{} must be in [0, 1), got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Applies random transformations and final preprocessing
#[derive(Clone, Debug)]
pub struct Augmenter {
    config: AugmentationConfig,
    image_size: usize,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig, image_size: usize) -> Self {
        Self { config, image_size }
    }

    /// Augmenter that only resizes
    pub fn no_augmentation(image_size: usize) -> Self {
        Self::new(AugmentationConfig::none(), image_size)
    }

    pub fn config(&self) -> &AugmentationConfig {
        &self.config
    }

    /// Apply the configured random transformations
    pub fn augment(&self, img: DynamicImage, rng: &mut ChaCha8Rng) -> DynamicImage {
        let mut result = img;

        if self.config.horizontal_flip_prob > 0.0 && rng.gen::<f32>() < self.config.horizontal_flip_prob {
            result = result.fliph();
        }

        if self.config.width_shift_range > 0.0 || self.config.height_shift_range > 0.0 {
            let (width, height) = result.dimensions();
            let dx = random_offset(rng, self.config.width_shift_range, width);
            let dy = random_offset(rng, self.config.height_shift_range, height);
            result = shift(&result, dx, dy);
        }

        result
    }

    /// Augment (when an RNG is given), resize and convert to CHW `[0, 1]`
    pub fn preprocess(&self, img: DynamicImage, rng: Option<&mut ChaCha8Rng>) -> Vec<f32> {
        let img = match rng {
            Some(rng) => self.augment(img, rng),
            None => img,
        };

        to_chw(&resize_exact(&img, self.image_size))
    }
}

fn random_offset(rng: &mut ChaCha8Rng, range: f32, extent: u32) -> i64 {
    if range <= 0.0 {
        return 0;
    }
    let fraction = rng.gen_range(-range..=range);
    (fraction * extent as f32).round() as i64
}

/// Translate by `(dx, dy)` pixels, filling with the nearest edge pixel
pub fn shift(img: &DynamicImage, dx: i64, dy: i64) -> DynamicImage {
    if dx == 0 && dy == 0 {
        return img.clone();
    }

    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let max_x = width as i64 - 1;
    let max_y = height as i64 - 1;

    let output: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        let src_x = (x as i64 - dx).clamp(0, max_x) as u32;
        let src_y = (y as i64 - dy).clamp(0, max_y) as u32;
        *rgb.get_pixel(src_x, src_y)
    });

    DynamicImage::ImageRgb8(output)
}
