//! Predictions from a saved model
//!
//! Images go through the same resize and normalization as during training,
//! then through the frozen backbone and the trained head.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::tensor::{backend::Backend, Tensor, TensorData};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::dataset::is_image_file;
use crate::dataset::preprocess::{load_image, resize_exact, to_chw};
use crate::dataset::ImageFolderDataset;
use crate::model::{TransferClassifier, TransferModelConfig};
use crate::utils::error::{Result, TransferError};
use crate::utils::metrics::Metrics;

/// Result of a single prediction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Path to the input image (if applicable)
    pub image_path: Option<PathBuf>,

    /// Predicted class index
    pub predicted_class: usize,

    /// Predicted class name
    pub class_name: String,

    /// Probability of the predicted class
    pub confidence: f32,

    /// Probability for every class, in label order
    pub probabilities: Vec<f32>,

    /// Inference time in milliseconds (batch time divided by batch size)
    pub inference_time_ms: f64,
}

impl PredictionResult {
    pub fn new(
        probabilities: Vec<f32>,
        class_names: &[String],
        inference_time_ms: f64,
        image_path: Option<PathBuf>,
    ) -> Self {
        let (predicted_class, confidence) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, p)| if p > best.1 { (i, p) } else { best });

        let class_name = class_names
            .get(predicted_class)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            image_path,
            predicted_class,
            class_name,
            confidence: confidence.max(0.0),
            probabilities,
            inference_time_ms,
        }
    }

    /// Gap between the two most likely classes
    pub fn margin(&self) -> f32 {
        let mut sorted = self.probabilities.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        match sorted.as_slice() {
            [first, second, ..] => first - second,
            [only] => *only,
            [] => 0.0,
        }
    }

    pub fn display(&self) -> String {
        let mut output = String::new();

        if let Some(path) = &self.image_path {
            output.push_str(&format!("Image: {:?}\n", path));
        }
        output.push_str(&format!(
            "Prediction: {} (class {})\n",
            self.class_name, self.predicted_class
        ));
        output.push_str(&format!("Confidence: {:.2}%\n", self.confidence * 100.0));
        output.push_str(&format!("Inference time: {:.2} ms\n", self.inference_time_ms));

        output
    }
}

/// Runs a trained [`TransferClassifier`] on images
pub struct Predictor<B: Backend> {
    model: TransferClassifier<B>,
    config: TransferModelConfig,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(model: TransferClassifier<B>, config: TransferModelConfig, device: B::Device) -> Result<Self> {
        if model.num_classes() != config.num_classes() {
            return Err(TransferError::Model(format!(
                "Model has {} outputs but the config names {} classes",
                model.num_classes(),
                config.num_classes()
            )));
        }

        Ok(Self {
            model,
            config,
            device,
        })
    }

    /// Load a model directory written by training
    pub fn load(model_dir: &Path, device: B::Device) -> Result<Self> {
        let (model, config) = TransferClassifier::<B>::load(model_dir, &device)?;
        Self::new(model, config, device)
    }

    pub fn class_names(&self) -> &[String] {
        &self.config.class_names
    }

    pub fn config(&self) -> &TransferModelConfig {
        &self.config
    }

    pub fn image_size(&self) -> usize {
        self.config.image_size
    }

    fn preprocess(&self, image: &DynamicImage) -> Vec<f32> {
        let mut data = to_chw(&resize_exact(image, self.config.image_size));
        self.config.normalization.apply_chw(&mut data);
        data
    }

    /// Class probabilities for each image, plus the elapsed milliseconds
    fn probabilities(&self, images: &[DynamicImage]) -> Result<(Vec<Vec<f32>>, f64)> {
        if images.is_empty() {
            return Ok((Vec::new(), 0.0));
        }

        let start = Instant::now();
        let size = self.config.image_size;
        let data: Vec<f32> = images.iter().flat_map(|img| self.preprocess(img)).collect();

        let input = Tensor::<B, 4>::from_floats(
            TensorData::new(data, [images.len(), 3, size, size]),
            &self.device,
        );
        let probs = self
            .model
            .forward_softmax(input)?
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| TransferError::Inference(format!("Failed to read probabilities: {:?}", e)))?;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        let per_image = probs
            .chunks(self.model.num_classes())
            .map(|row| row.to_vec())
            .collect();
        Ok((per_image, elapsed_ms))
    }

    pub fn predict_image(&self, image: &DynamicImage) -> Result<PredictionResult> {
        let (mut probs, elapsed_ms) = self.probabilities(std::slice::from_ref(image))?;
        let row = probs
            .pop()
            .ok_or_else(|| TransferError::Inference("Model returned no output".to_string()))?;
        Ok(PredictionResult::new(row, self.class_names(), elapsed_ms, None))
    }

    pub fn predict_path(&self, path: &Path) -> Result<PredictionResult> {
        let image = load_image(path)?;
        let mut result = self.predict_image(&image)?;
        result.image_path = Some(path.to_path_buf());
        Ok(result)
    }

    /// Predict every image under `dir` (recursively, sorted by path).
    /// Unreadable files are skipped with a warning.
    pub fn predict_dir(&self, dir: &Path, batch_size: usize) -> Result<Vec<PredictionResult>> {
        if !dir.is_dir() {
            return Err(TransferError::PathNotFound(dir.to_path_buf()));
        }

        let paths: Vec<PathBuf> = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.into_path())
            .filter(|path| path.is_file() && is_image_file(path))
            .collect();

        let mut results = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(batch_size.max(1)) {
            let mut loaded = Vec::with_capacity(chunk.len());
            let mut images = Vec::with_capacity(chunk.len());
            for path in chunk {
                match load_image(path) {
                    Ok(img) => {
                        loaded.push(path.clone());
                        images.push(img);
                    }
                    Err(e) => warn!("Skipping {:?}: {}", path, e),
                }
            }

            let (probs, elapsed_ms) = self.probabilities(&images)?;
            let per_image_ms = elapsed_ms / images.len().max(1) as f64;
            for (path, row) in loaded.into_iter().zip(probs) {
                results.push(PredictionResult::new(row, self.class_names(), per_image_ms, Some(path)));
            }
        }

        debug!("Predicted {} images under {:?}", results.len(), dir);
        Ok(results)
    }
}

/// Accuracy and confusion matrix on a labelled `<dir>/<class>/*` folder.
///
/// Class directories must use the model's class names.
pub fn evaluate_dir<B: Backend>(predictor: &Predictor<B>, dir: &Path, batch_size: usize) -> Result<Metrics> {
    let dataset = ImageFolderDataset::with_class_names(dir, predictor.class_names())?;

    let mut predictions = Vec::with_capacity(dataset.len());
    let mut ground_truth = Vec::with_capacity(dataset.len());

    for chunk in dataset.samples.chunks(batch_size.max(1)) {
        let mut labels = Vec::with_capacity(chunk.len());
        let mut images = Vec::with_capacity(chunk.len());
        for sample in chunk {
            match load_image(&sample.path) {
                Ok(img) => {
                    labels.push(sample.label);
                    images.push(img);
                }
                Err(e) => warn!("Skipping {:?}: {}", sample.path, e),
            }
        }

        let (probs, _) = predictor.probabilities(&images)?;
        for (label, row) in labels.into_iter().zip(probs) {
            let result = PredictionResult::new(row, predictor.class_names(), 0.0, None);
            predictions.push(result.predicted_class);
            ground_truth.push(label);
        }
    }

    if predictions.is_empty() {
        return Err(TransferError::Inference(format!(
            "No readable images under {:?}",
            dir
        )));
    }

    let metrics = Metrics::from_predictions(&predictions, &ground_truth, predictor.class_names().len())
        .with_class_names(predictor.class_names());
    info!(
        "Evaluated {} images from {:?}: accuracy {:.2}%",
        metrics.total_samples,
        dir,
        metrics.accuracy * 100.0
    );

    Ok(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Normalization;
    use crate::model::onnx::test_graph::pooling_config;
    use crate::model::{BackboneKind, BackboneSpec, ClassifierHeadConfig, ConvBackboneConfig, TensorLayout};
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Rgb};
    use std::fs;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn tiny_config() -> TransferModelConfig {
        TransferModelConfig::new(
            BackboneKind::Compact,
            BackboneSpec::Record(ConvBackboneConfig::new(vec![4, 8])),
            ClassifierHeadConfig::new(8),
            16,
            Normalization::ImageNet,
            vec!["rural".to_string(), "urban".to_string()],
        )
    }

    fn predictor() -> Predictor<TestBackend> {
        let device = Default::default();
        let config = tiny_config();
        let model = TransferClassifier::from_config(&config, None, &device).unwrap();
        Predictor::new(model, config, device).unwrap()
    }

    fn write_png(path: &Path, value: u8) {
        ImageBuffer::from_pixel(24, 24, Rgb([value, value, value]))
            .save(path)
            .unwrap();
    }

    #[test]
    fn test_prediction_result_argmax() {
        let names = vec!["rural".to_string(), "urban".to_string()];
        let result = PredictionResult::new(vec![0.2, 0.8], &names, 1.5, None);

        assert_eq!(result.predicted_class, 1);
        assert_eq!(result.class_name, "urban");
        assert!((result.confidence - 0.8).abs() < 1e-6);
        assert!((result.margin() - 0.6).abs() < 1e-6);
        assert!(result.display().contains("urban"));
    }

    #[test]
    fn test_predict_image_probabilities() {
        let predictor = predictor();
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(40, 30, Rgb([120, 80, 200])));

        let result = predictor.predict_image(&image).unwrap();
        assert_eq!(result.probabilities.len(), 2);
        let total: f32 = result.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
        assert!(result.confidence >= 0.5);
    }

    #[test]
    fn test_predict_dir_skips_non_images() {
        let dir = TempDir::new().unwrap();
        write_png(&dir.path().join("a.png"), 10);
        write_png(&dir.path().join("b.png"), 200);
        fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        fs::write(dir.path().join("broken.png"), "garbage").unwrap();

        let results = predictor().predict_dir(dir.path(), 8).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].image_path.as_ref().unwrap().ends_with("a.png"));
    }

    #[test]
    fn test_predict_missing_dir() {
        let result = predictor().predict_dir(Path::new("/no/such/dir"), 4);
        assert!(matches!(result, Err(TransferError::PathNotFound(_))));
    }

    #[test]
    fn test_evaluate_dir_counts_every_image() {
        let dir = TempDir::new().unwrap();
        for (class, value) in [("rural", 20u8), ("urban", 230u8)] {
            fs::create_dir_all(dir.path().join(class)).unwrap();
            for i in 0..3 {
                write_png(&dir.path().join(class).join(format!("{i}.png")), value);
            }
        }

        let metrics = evaluate_dir(&predictor(), dir.path(), 4).unwrap();
        assert_eq!(metrics.total_samples, 6);
        assert_eq!(metrics.confusion_matrix.total(), 6);
        assert_eq!(metrics.per_class.len(), 2);
    }

    #[test]
    fn test_load_saved_model() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let config = tiny_config();
        TransferClassifier::<TestBackend>::from_config(&config, None, &device)
            .unwrap()
            .save(dir.path(), &config)
            .unwrap();

        let predictor = Predictor::<TestBackend>::load(dir.path(), device).unwrap();
        assert_eq!(predictor.class_names(), ["rural".to_string(), "urban".to_string()]);
        assert_eq!(predictor.image_size(), 16);
    }

    #[test]
    fn test_predict_through_onnx_backbone() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let mut config = TransferModelConfig::for_backbone(
            BackboneKind::ResNet50,
            BackboneSpec::Onnx(pooling_config(dir.path(), TensorLayout::Nhwc)),
            vec!["rural".to_string(), "urban".to_string()],
        );
        config.image_size = 12;
        let model = TransferClassifier::<TestBackend>::from_config(&config, None, &device).unwrap();
        let predictor = Predictor::new(model, config, device).unwrap();

        let images = [
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(30, 20, Rgb([250, 10, 10]))),
            DynamicImage::ImageRgb8(ImageBuffer::from_pixel(20, 30, Rgb([10, 10, 250]))),
        ];
        for image in &images {
            let result = predictor.predict_image(image).unwrap();
            let total: f32 = result.probabilities.iter().sum();
            assert!((total - 1.0).abs() < 1e-4);
        }
    }
}
