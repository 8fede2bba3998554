//! Evaluation metrics
//!
//! Accuracy, per-class precision/recall/F1 and a confusion matrix. All
//! ratios are fractions in `[0, 1]`.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Counts indexed as `rows[actual][predicted]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,
    rows: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            rows: vec![vec![0; num_classes]; num_classes],
        }
    }

    /// Pairs are zipped, so a length mismatch only counts the common prefix.
    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], num_classes: usize) -> Self {
        ground_truth
            .iter()
            .zip(predictions)
            .fold(Self::new(num_classes), |mut cm, (&actual, &predicted)| {
                cm.add(actual, predicted);
                cm
            })
    }

    /// Out-of-range labels are dropped.
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if let Some(cell) = self.rows.get_mut(actual).and_then(|row| row.get_mut(predicted)) {
            *cell += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        self.rows
            .get(actual)
            .and_then(|row| row.get(predicted))
            .copied()
            .unwrap_or(0)
    }

    /// Samples whose true label is `class`
    pub fn row_total(&self, class: usize) -> usize {
        self.rows.get(class).map_or(0, |row| row.iter().sum())
    }

    /// Samples predicted as `class`
    pub fn column_total(&self, class: usize) -> usize {
        self.rows.iter().map(|row| row.get(class).copied().unwrap_or(0)).sum()
    }

    pub fn total(&self) -> usize {
        self.rows.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|c| self.get(c, c)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Text table, diagonal cells bracketed
    pub fn display(&self, class_names: Option<&[String]>) -> String {
        let name = |c: usize| -> String {
            class_names
                .and_then(|names| names.get(c))
                .cloned()
                .unwrap_or_else(|| c.to_string())
        };
        let width = (0..self.num_classes)
            .map(|c| name(c).len())
            .chain(std::iter::once(7))
            .max()
            .unwrap_or(7);

        let mut out = String::from("\nconfusion matrix (rows: actual, columns: predicted)\n");
        let _ = write!(out, "{:width$}", "");
        for c in 0..self.num_classes {
            let _ = write!(out, " {:>width$}", name(c));
        }
        out.push('\n');
        for (actual, row) in self.rows.iter().enumerate() {
            let _ = write!(out, "{:>width$}", name(actual));
            for (predicted, count) in row.iter().enumerate() {
                let cell = if actual == predicted {
                    format!("[{count}]")
                } else {
                    count.to_string()
                };
                let _ = write!(out, " {cell:>width$}");
            }
            out.push('\n');
        }
        out
    }
}

/// One row of the per-class report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub class_name: Option<String>,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    /// Samples whose true label is this class
    pub support: usize,
}

impl ClassMetrics {
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let hits = cm.get(class_idx, class_idx);
        let support = cm.row_total(class_idx);
        let precision = ratio(hits, cm.column_total(class_idx));
        let recall = ratio(hits, support);
        let f1 = match precision + recall {
            sum if sum > 0.0 => 2.0 * precision * recall / sum,
            _ => 0.0,
        };
        Self {
            class_idx,
            class_name: None,
            precision,
            recall,
            f1,
            support,
        }
    }

    fn label(&self) -> String {
        self.class_name.clone().unwrap_or_else(|| self.class_idx.to_string())
    }
}

/// Result of one evaluation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_samples: usize,
    pub correct_predictions: usize,
    pub accuracy: f64,
    /// Mean cross-entropy over the evaluated batches, when known
    pub average_loss: Option<f64>,
    /// Macro averages skip classes with no support
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

impl Metrics {
    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], num_classes: usize) -> Self {
        Self::from_confusion_matrix(ConfusionMatrix::from_predictions(
            predictions,
            ground_truth,
            num_classes,
        ))
    }

    pub fn from_confusion_matrix(confusion_matrix: ConfusionMatrix) -> Self {
        let per_class: Vec<ClassMetrics> = (0..confusion_matrix.num_classes)
            .map(|c| ClassMetrics::from_confusion_matrix(&confusion_matrix, c))
            .collect();

        let present: Vec<&ClassMetrics> = per_class.iter().filter(|c| c.support > 0).collect();
        let macro_avg = |pick: fn(&ClassMetrics) -> f64| match present.len() {
            0 => 0.0,
            n => present.iter().map(|c| pick(c)).sum::<f64>() / n as f64,
        };

        Self {
            total_samples: confusion_matrix.total(),
            correct_predictions: confusion_matrix.correct(),
            accuracy: confusion_matrix.accuracy(),
            average_loss: None,
            macro_precision: macro_avg(|c| c.precision),
            macro_recall: macro_avg(|c| c.recall),
            macro_f1: macro_avg(|c| c.f1),
            per_class,
            confusion_matrix,
        }
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.average_loss = Some(loss);
        self
    }

    pub fn with_class_names(mut self, names: &[String]) -> Self {
        for class in &mut self.per_class {
            class.class_name = names.get(class.class_idx).cloned();
        }
        self
    }

    /// Summary, per-class table and confusion matrix
    pub fn display(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "accuracy {:.2}% ({}/{})",
            self.accuracy * 100.0,
            self.correct_predictions,
            self.total_samples
        );
        if let Some(loss) = self.average_loss {
            let _ = writeln!(out, "loss     {loss:.4}");
        }
        let _ = writeln!(
            out,
            "macro    precision {:.2}% | recall {:.2}% | f1 {:.2}%",
            self.macro_precision * 100.0,
            self.macro_recall * 100.0,
            self.macro_f1 * 100.0
        );

        let _ = writeln!(out, "\n{:<12} {:>9} {:>8} {:>8} {:>8}", "class", "precision", "recall", "f1", "support");
        for class in &self.per_class {
            let _ = writeln!(
                out,
                "{:<12} {:>8.2}% {:>7.2}% {:>7.2}% {:>8}",
                class.label(),
                class.precision * 100.0,
                class.recall * 100.0,
                class.f1 * 100.0,
                class.support
            );
        }

        let names: Vec<String> = self.per_class.iter().map(ClassMetrics::label).collect();
        out.push_str(&self.confusion_matrix.display(Some(&names)));
        out
    }
}

impl std::fmt::Display for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display())
    }
}

/// Mean of per-batch losses within an epoch
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    /// 0 before the first update
    pub fn average(&self) -> f64 {
        match self.count {
            0 => 0.0,
            n => self.sum / n as f64,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}
