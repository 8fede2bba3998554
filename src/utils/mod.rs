//! Utilities for logging, metrics, errors and console formatting

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{Result, TransferError};
pub use logging::{init_logging, LogConfig, LogLevel, TrainingLogger};
pub use metrics::{ConfusionMatrix, Metrics, RunningAverage};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Independent random streams derived from one experiment seed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngStream {
    /// Per-epoch batch order
    Shuffle = 1,
    /// Per-batch augmentation draws
    Augment = 2,
    /// The fixed validation subset
    Validation = 3,
    /// Dataset subsampling
    Sampling = 4,
}

/// RNG for `counter` (an epoch or batch index) on one stream of `seed`.
///
/// Equal `seed + counter` values on different streams never share draws.
pub fn seeded_rng(seed: u64, stream: RngStream, counter: u64) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(counter));
    rng.set_stream(stream as u64);
    rng
}

/// Render elapsed seconds for console output: `42.0s`, `3m 07s`, `2h 05m`.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        return format!("{seconds:.1}s");
    }
    let whole = seconds.round() as u64;
    let (h, m, s) = (whole / 3600, (whole % 3600) / 60, whole % 60);
    if h == 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{h}h {m:02}m")
    }
}

/// Group the digits of a count in threes, e.g. parameter totals.
pub fn format_number(n: usize) -> String {
    let digits = n.to_string();
    let lead = digits.len() % 3;
    let mut out = String::from(&digits[..lead]);
    for group in digits.as_bytes()[lead..].chunks(3) {
        if !out.is_empty() {
            out.push(',');
        }
        out.extend(group.iter().map(|&b| b as char));
    }
    out
}
