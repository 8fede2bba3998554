//! Pretrained backbones exported to ONNX and run with ONNX Runtime.
//!
//! The expected export is a Keras application built with
//! `include_top=False, pooling="avg"`: one image input and a pooled
//! `[batch, feature_dim]` output. Keras exports take NHWC input and name
//! the pooled output `avg_pool`; both can be overridden for other exports.
//! Pixels are normalized before they reach the graph, so the export must
//! not contain its own preprocessing layer.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{Tensor as OrtTensor, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backbone::FeatureExtractor;
use crate::utils::error::{Result, TransferError};

/// Output name of a Keras application exported with `pooling="avg"`
pub const DEFAULT_OUTPUT_NAME: &str = "avg_pool";

/// Memory layout of the graph's image input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
    /// `[batch, h, w, channels]`, the TensorFlow default
    #[default]
    Nhwc,
    /// `[batch, channels, h, w]`
    Nchw,
}

impl fmt::Display for TensorLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorLayout::Nhwc => write!(f, "nhwc"),
            TensorLayout::Nchw => write!(f, "nchw"),
        }
    }
}

impl FromStr for TensorLayout {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "nhwc" | "channels_last" => Ok(TensorLayout::Nhwc),
            "nchw" | "channels_first" => Ok(TensorLayout::Nchw),
            other => Err(TransferError::InvalidInput(format!(
                "Unknown tensor layout '{}' (expected nhwc or nchw)",
                other
            ))),
        }
    }
}

fn default_output_name() -> String {
    DEFAULT_OUTPUT_NAME.to_string()
}

/// Where an exported backbone lives and how to call it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnnxBackboneConfig {
    pub model_path: PathBuf,
    /// Width of the pooled output
    pub feature_dim: usize,
    #[serde(default)]
    pub input_layout: TensorLayout,
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

impl OnnxBackboneConfig {
    pub fn new(model_path: impl Into<PathBuf>, feature_dim: usize) -> Self {
        Self {
            model_path: model_path.into(),
            feature_dim,
            input_layout: TensorLayout::default(),
            output_name: default_output_name(),
        }
    }

    pub fn with_input_layout(mut self, layout: TensorLayout) -> Self {
        self.input_layout = layout;
        self
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.feature_dim == 0 {
            return Err(TransferError::Config(
                "ONNX backbone feature_dim must be positive".to_string(),
            ));
        }
        if self.output_name.trim().is_empty() {
            return Err(TransferError::Config(
                "ONNX backbone output name is empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Frozen backbone evaluated by ONNX Runtime
pub struct OnnxBackbone {
    session: Mutex<Session>,
    config: OnnxBackboneConfig,
}

impl fmt::Debug for OnnxBackbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnnxBackbone").field("config", &self.config).finish()
    }
}

impl OnnxBackbone {
    pub fn load(config: OnnxBackboneConfig) -> Result<Self> {
        config.validate()?;
        if !config.model_path.exists() {
            return Err(TransferError::PathNotFound(config.model_path.clone()));
        }

        let session = create_session(&config.model_path)?;
        info!(
            "Loaded ONNX backbone from {:?} ({} input, output '{}', {}-d features)",
            config.model_path, config.input_layout, config.output_name, config.feature_dim
        );

        Ok(Self {
            session: Mutex::new(session),
            config,
        })
    }

    pub fn config(&self) -> &OnnxBackboneConfig {
        &self.config
    }

    /// Run the graph on a flat input, returning the output shape and values
    fn run(&self, input: Vec<f32>, shape: [usize; 4]) -> Result<(Vec<i64>, Vec<f32>)> {
        let input: Value = OrtTensor::from_array((shape.to_vec(), input.into_boxed_slice()))
            .map(Value::from)
            .map_err(|e| TransferError::Inference(format!("Failed to create input tensor: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| TransferError::Inference("ONNX session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| TransferError::Inference(format!("ONNX inference failed: {}", e)))?;

        let output = outputs.get(self.config.output_name.as_str()).ok_or_else(|| {
            TransferError::Inference(format!(
                "ONNX backbone has no output named '{}'",
                self.config.output_name
            ))
        })?;

        let (dims, values) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| TransferError::Inference(format!("Failed to read backbone output: {}", e)))?;

        Ok((dims.iter().copied().collect(), values.to_vec()))
    }
}

impl<B: Backend> FeatureExtractor<B> for OnnxBackbone {
    fn extract(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        let device = images.device();
        let [batch, channels, height, width] = images.dims();

        let (images, shape) = match self.config.input_layout {
            TensorLayout::Nchw => (images, [batch, channels, height, width]),
            TensorLayout::Nhwc => (images.permute([0, 2, 3, 1]), [batch, height, width, channels]),
        };

        let input = images
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| TransferError::Inference(format!("Failed to read image batch: {:?}", e)))?;

        let (dims, values) = self.run(input, shape)?;
        let rows = pooled_rows(&dims, values, batch, self.config.feature_dim)?;

        Ok(Tensor::from_floats(
            TensorData::new(rows, [batch, self.config.feature_dim]),
            &device,
        ))
    }

    fn feature_dim(&self) -> usize {
        self.config.feature_dim
    }
}

/// Check a pooled output is `[batch, feature_dim]` up to singleton axes
/// (`[n, 1, 1, d]` and `[n, d, 1, 1]` both pass).
fn pooled_rows(dims: &[i64], values: Vec<f32>, batch: usize, feature_dim: usize) -> Result<Vec<f32>> {
    let mismatch = || {
        TransferError::Inference(format!(
            "Backbone output has shape {:?}, expected [{}, {}]; export the model with global pooling",
            dims, batch, feature_dim
        ))
    };

    let (&leading, rest) = dims.split_first().ok_or_else(mismatch)?;
    let wide: Vec<i64> = rest.iter().copied().filter(|&d| d != 1).collect();
    let width_ok = match wide.as_slice() {
        [] => feature_dim == 1,
        [d] => *d as usize == feature_dim,
        _ => false,
    };

    if leading as usize != batch || !width_ok || values.len() != batch * feature_dim {
        return Err(mismatch());
    }
    Ok(values)
}

fn create_session(model_path: &Path) -> Result<Session> {
    let model_bytes = std::fs::read(model_path)?;

    let builder = Session::builder()
        .map_err(|e| TransferError::Model(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| TransferError::Model(format!("Failed to set optimization level: {}", e)))?;

    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        if let Ok(cuda_builder) = builder
            .clone()
            .with_execution_providers([CUDAExecutionProvider::default().build()])
        {
            if let Ok(session) = cuda_builder.commit_from_memory(&model_bytes) {
                info!("Using CUDA execution provider for the backbone");
                return Ok(session);
            }
        }
        debug!("CUDA execution provider not available, using CPU");
    }

    debug!("Creating CPU session for {:?}", model_path);
    builder
        .commit_from_memory(&model_bytes)
        .map_err(|e| TransferError::Model(format!("Failed to load ONNX model {:?}: {}", model_path, e)))
}

/// Tiny hand-encoded ONNX graphs for tests
#[cfg(test)]
pub(crate) mod test_graph {
    use super::*;

    fn varint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn put_varint(out: &mut Vec<u8>, field: u64, v: u64) {
        varint(field << 3, out);
        varint(v, out);
    }

    fn put_bytes(out: &mut Vec<u8>, field: u64, bytes: &[u8]) {
        varint((field << 3) | 2, out);
        varint(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }

    enum Dim {
        Fixed(u64),
        Named(&'static str),
    }

    fn value_info(name: &str, dims: &[Dim]) -> Vec<u8> {
        let mut shape = Vec::new();
        for dim in dims {
            let mut d = Vec::new();
            match dim {
                Dim::Fixed(v) => put_varint(&mut d, 1, *v),
                Dim::Named(n) => put_bytes(&mut d, 2, n.as_bytes()),
            }
            put_bytes(&mut shape, 1, &d);
        }
        let mut tensor = Vec::new();
        put_varint(&mut tensor, 1, 1); // FLOAT
        put_bytes(&mut tensor, 2, &shape);
        let mut ty = Vec::new();
        put_bytes(&mut ty, 1, &tensor);

        let mut info = Vec::new();
        put_bytes(&mut info, 1, name.as_bytes());
        put_bytes(&mut info, 2, &ty);
        info
    }

    fn node(op: &str, input: &str, output: &str, perm: Option<&[u64]>) -> Vec<u8> {
        let mut n = Vec::new();
        put_bytes(&mut n, 1, input.as_bytes());
        put_bytes(&mut n, 2, output.as_bytes());
        put_bytes(&mut n, 3, output.as_bytes());
        put_bytes(&mut n, 4, op.as_bytes());
        if let Some(perm) = perm {
            let mut attr = Vec::new();
            put_bytes(&mut attr, 1, b"perm");
            for &p in perm {
                put_varint(&mut attr, 8, p);
            }
            put_varint(&mut attr, 20, 7); // INTS
            put_bytes(&mut n, 5, &attr);
        }
        n
    }

    /// Global average pooling graph: `images` -> `features` `[N, 3]`
    pub fn pooling_model(layout: TensorLayout) -> Vec<u8> {
        let mut graph = Vec::new();
        let (pool_input, input_dims) = match layout {
            TensorLayout::Nchw => (
                "images",
                [Dim::Named("N"), Dim::Fixed(3), Dim::Named("H"), Dim::Named("W")],
            ),
            TensorLayout::Nhwc => {
                put_bytes(&mut graph, 1, &node("Transpose", "images", "chw", Some(&[0, 3, 1, 2])));
                (
                    "chw",
                    [Dim::Named("N"), Dim::Named("H"), Dim::Named("W"), Dim::Fixed(3)],
                )
            }
        };
        put_bytes(&mut graph, 1, &node("GlobalAveragePool", pool_input, "pooled", None));
        put_bytes(&mut graph, 1, &node("Flatten", "pooled", "features", None));
        put_bytes(&mut graph, 2, b"pooling");
        put_bytes(&mut graph, 11, &value_info("images", &input_dims));
        put_bytes(&mut graph, 12, &value_info("features", &[Dim::Named("N"), Dim::Fixed(3)]));

        let mut opset = Vec::new();
        put_bytes(&mut opset, 1, b"");
        put_varint(&mut opset, 2, 13);

        let mut model = Vec::new();
        put_varint(&mut model, 1, 7);
        put_bytes(&mut model, 7, &graph);
        put_bytes(&mut model, 8, &opset);
        model
    }

    /// Write a pooling graph with 3-d output `features` into `dir`
    pub fn write_pooling_model(dir: &Path, layout: TensorLayout) -> PathBuf {
        let path = dir.join(format!("pool_{layout}.onnx"));
        std::fs::write(&path, pooling_model(layout)).unwrap();
        path
    }

    /// Config for [`write_pooling_model`]
    pub fn pooling_config(dir: &Path, layout: TensorLayout) -> OnnxBackboneConfig {
        OnnxBackboneConfig::new(write_pooling_model(dir, layout), 3)
            .with_input_layout(layout)
            .with_output_name("features")
    }
}
