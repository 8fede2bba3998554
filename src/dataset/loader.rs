//! Image folder discovery
//!
//! Reads a directory laid out as one sub-directory per class:
//!
//! ```text
//! root_dir/
//! ├── rural/
//! │   ├── farm_001.jpg
//! │   └── ...
//! └── urban/
//!     └── ...
//! ```

use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::is_image_file;
use crate::utils::error::{Result, TransferError};
use crate::utils::{seeded_rng, RngStream};

/// One labelled image file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    pub path: PathBuf,
    /// Index into the dataset's `class_names`
    pub label: usize,
    pub class_name: String,
}

/// Labelled images discovered from class-named directories
#[derive(Debug, Clone)]
pub struct ImageFolderDataset {
    pub root_dir: PathBuf,
    /// Grouped by class in label order, sorted by path within a class
    pub samples: Vec<ImageSample>,
    /// Label `i` is `class_names[i]`
    pub class_names: Vec<String>,
}

impl ImageFolderDataset {
    /// Scan `root_dir`, deriving class labels from the sorted directory names
    pub fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref();
        let class_names = class_dirs(root_dir)?;
        if class_names.is_empty() {
            return Err(TransferError::Dataset(format!(
                "{} has no class sub-directories",
                root_dir.display()
            )));
        }
        Self::scan(root_dir, class_names)
    }

    /// Scan `root_dir` against a fixed class list.
    ///
    /// Used for validation data so labels match the training split. A
    /// directory that is not in `class_names` is an error.
    pub fn with_class_names<P: AsRef<Path>>(root_dir: P, class_names: &[String]) -> Result<Self> {
        let root_dir = root_dir.as_ref();
        if let Some(unknown) = class_dirs(root_dir)?
            .into_iter()
            .find(|dir| !class_names.contains(dir))
        {
            return Err(TransferError::Dataset(format!(
                "unexpected class directory '{unknown}' in {} (known: {})",
                root_dir.display(),
                class_names.join(", ")
            )));
        }
        Self::scan(root_dir, class_names.to_vec())
    }

    fn scan(root_dir: &Path, class_names: Vec<String>) -> Result<Self> {
        info!(classes = class_names.len(), "scanning {}", root_dir.display());

        let mut samples = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            let files = image_files(&root_dir.join(class_name));
            if files.is_empty() {
                return Err(TransferError::Dataset(format!(
                    "class '{class_name}' has no images under {}",
                    root_dir.display()
                )));
            }
            debug!(label, count = files.len(), "class '{class_name}'");
            samples.extend(files.into_iter().map(|path| ImageSample {
                path,
                label,
                class_name: class_name.clone(),
            }));
        }

        info!("found {} images", samples.len());
        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            samples,
            class_names,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Deterministic in-place shuffle
    pub fn shuffle(&mut self, seed: u64) {
        self.samples.shuffle(&mut seeded_rng(seed, RngStream::Sampling, 0));
    }

    /// Keep a seeded random subset of at most `max` samples
    pub fn take(&mut self, max: usize, seed: u64) {
        if self.samples.len() <= max {
            return;
        }
        warn!("using {max} of {} images", self.samples.len());
        self.shuffle(seed);
        self.samples.truncate(max);
    }

    pub fn get_samples_by_class(&self, class_idx: usize) -> Vec<&ImageSample> {
        self.samples.iter().filter(|s| s.label == class_idx).collect()
    }

    /// `(path, label)` pairs for building Burn datasets
    pub fn pairs(&self) -> Vec<(PathBuf, usize)> {
        self.samples.iter().map(|s| (s.path.clone(), s.label)).collect()
    }

    pub fn get_stats(&self) -> DatasetStats {
        let class_counts = (0..self.num_classes())
            .map(|label| self.samples.iter().filter(|s| s.label == label).count())
            .collect();
        DatasetStats {
            total_samples: self.len(),
            num_classes: self.num_classes(),
            class_counts,
            class_names: self.class_names.clone(),
        }
    }
}

/// Sorted names of the visible sub-directories of `root_dir`
fn class_dirs(root_dir: &Path) -> Result<Vec<String>> {
    if !root_dir.is_dir() {
        return Err(TransferError::PathNotFound(root_dir.to_path_buf()));
    }
    let mut names = Vec::new();
    for entry in WalkDir::new(root_dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| TransferError::Dataset(e.to_string()))?;
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_dir() && !name.starts_with('.') {
            names.push(name.into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Sorted image files directly inside `dir`; empty if `dir` is missing
fn image_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_image_file(e.path()))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Per-class image counts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub num_classes: usize,
    pub class_counts: Vec<usize>,
    pub class_names: Vec<String>,
}

impl DatasetStats {
    /// Per-class counts with a proportional bar
    pub fn print(&self) {
        println!("\n  {} images, {} classes", self.total_samples, self.num_classes);
        for (label, (name, count)) in self.class_names.iter().zip(&self.class_counts).enumerate() {
            let share = *count as f64 / self.total_samples.max(1) as f64;
            let bar = "#".repeat((share * 40.0).round() as usize);
            println!("  {label:>3}  {name:<12} {count:>7}  {:>5.1}%  {bar}", share * 100.0);
        }
    }

    /// Largest class count over the smallest; infinite if a class is empty
    pub fn imbalance_ratio(&self) -> f64 {
        match (self.class_counts.iter().max(), self.class_counts.iter().min()) {
            (Some(&max), Some(&min)) if min > 0 => max as f64 / min as f64,
            _ => f64::INFINITY,
        }
    }
}
