//! Dataset handling for the urban/rural image folders
//!
//! - `loader`: discovers `<root>/<class_name>/*.jpg` style folders
//! - `preprocess`: resize, CHW conversion and pixel normalization
//! - `augmentation`: seeded random flips and shifts for training
//! - `burn_dataset`: Burn `Dataset`/`Batcher` implementations
//!
//! Class indices follow the sorted directory names, so with the reference
//! layout `rural` is 0 and `urban` is 1.

pub mod augmentation;
pub mod burn_dataset;
pub mod loader;
pub mod preprocess;

pub use augmentation::{AugmentationConfig, Augmenter};
pub use burn_dataset::{
    AugmentingBatcher, ImageBatch, ImageBatcher, ImageBurnDataset, ImageItem, RawImageDataset,
    RawImageItem,
};
pub use loader::{DatasetStats, ImageFolderDataset, ImageSample};
pub use preprocess::Normalization;

/// Default class names, in label order
pub const CLASS_NAMES: [&str; 2] = ["rural", "urban"];

/// File extensions accepted as images
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// Get the default class name for a label
pub fn class_name(label: usize) -> Option<&'static str> {
    CLASS_NAMES.get(label).copied()
}

/// Whether a path has one of the accepted image extensions
pub fn is_image_file(path: &std::path::Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}
