//! Model definitions
//!
//! - `backbone`: the frozen feature extractor seam, presets and the
//!   format-independent [`Backbone`]
//! - `conv`: a convolutional backbone stored as a Burn record
//! - `onnx`: pretrained backbones exported to ONNX
//! - `head`: the trainable linear classification layer
//! - `classifier`: backbone and head combined, with save/load

pub mod backbone;
pub mod classifier;
pub mod conv;
pub mod head;
pub mod onnx;

pub use backbone::{Backbone, BackboneKind, BackboneSpec, FeatureExtractor};
pub use classifier::{TransferClassifier, TransferModelConfig};
pub use conv::{
    load_conv_backbone, record_file, save_conv_backbone, ConvBackbone, ConvBackboneConfig,
};
pub use head::{ClassifierHead, ClassifierHeadConfig};
pub use onnx::{OnnxBackbone, OnnxBackboneConfig, TensorLayout};
