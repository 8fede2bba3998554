//! Logging Module
//!
//! Console logging on top of `tracing`. `RUST_LOG` takes precedence over the
//! configured level when it is set.

use std::str::FromStr;
use std::time::Instant;

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::error::{Result, TransferError};
use super::format_duration;

/// Console verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = TransferError;

    fn from_str(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(TransferError::Config(format!("unknown log level '{other}'"))),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(Level::from(*self).as_str())
    }
}

/// How the console subscriber is set up
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Prefix lines with the wall-clock time
    pub timestamps: bool,
    /// Show the emitting module and thread
    pub show_origin: bool,
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            show_origin: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Debug output with module paths and thread ids (`-v`)
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            show_origin: true,
            ..Self::default()
        }
    }

    /// Errors only, no timestamps
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            timestamps: false,
            ..Self::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.to_string().to_ascii_lowercase()))
    }
}

/// Install the global tracing subscriber.
///
/// Fails if a subscriber has already been installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let layer = fmt::layer()
        .compact()
        .with_ansi(config.ansi_colors)
        .with_target(config.show_origin)
        .with_thread_ids(config.show_origin);
    let registry = tracing_subscriber::registry().with(config.filter());

    let installed = match config.timestamps {
        true => registry.with(layer).try_init(),
        false => registry.with(layer.without_time()).try_init(),
    };
    installed.map_err(|e| TransferError::Config(format!("logging already initialized: {e}")))
}

/// Per-epoch progress lines with an ETA. Epoch numbers passed in are 0-based.
pub struct TrainingLogger {
    total_epochs: usize,
    current: usize,
    started: Instant,
    epoch_started: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        let now = Instant::now();
        Self {
            total_epochs,
            current: 0,
            started: now,
            epoch_started: now,
        }
    }

    fn eta_secs(&self) -> f64 {
        let done = self.current + 1;
        let per_epoch = self.started.elapsed().as_secs_f64() / done as f64;
        per_epoch * self.total_epochs.saturating_sub(done) as f64
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.current = epoch;
        self.epoch_started = Instant::now();
        tracing::info!("epoch {}/{}", epoch + 1, self.total_epochs);
    }

    /// Accuracies are fractions in `[0, 1]`.
    pub fn end_epoch(&self, train_loss: f64, train_accuracy: f64, val_accuracy: Option<f64>) {
        let val = match val_accuracy {
            Some(acc) => format!("{:.2}%", acc * 100.0),
            None => "-".to_string(),
        };
        tracing::info!(
            epoch = self.current + 1,
            "loss {train_loss:.4} | train acc {:.2}% | val acc {val} | took {} | eta {}",
            train_accuracy * 100.0,
            format_duration(self.epoch_started.elapsed().as_secs_f64()),
            format_duration(self.eta_secs()),
        );
    }

    pub fn log_new_best(&self, accuracy: f64) {
        tracing::info!("new best head: val acc {:.2}%", accuracy * 100.0);
    }

    pub fn log_early_stop(&self, patience: usize) {
        tracing::warn!("stopping early: no improvement for {patience} epochs");
    }

    pub fn log_complete(&self, epochs_run: usize, best_accuracy: f64) {
        tracing::info!(
            "finished {epochs_run} epochs in {}, best acc {:.2}%",
            format_duration(self.started.elapsed().as_secs_f64()),
            best_accuracy * 100.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(" INFO ".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("Warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_levels_order_by_verbosity() {
        assert!(LogLevel::Error < LogLevel::Info);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
    }

    #[test]
    fn test_log_config_presets() {
        let verbose = LogConfig::verbose();
        assert_eq!(verbose.level, LogLevel::Debug);
        assert!(verbose.show_origin && verbose.timestamps);
        assert!(!LogConfig::quiet().timestamps);
        assert_eq!(LogConfig::default().level, LogLevel::Info);
    }

    #[test]
    fn test_training_logger_eta() {
        let mut logger = TrainingLogger::new(3);
        logger.start_epoch(2);
        assert_eq!(logger.current, 2);
        assert_eq!(logger.eta_secs(), 0.0);
        logger.end_epoch(0.5, 0.75, None);
    }
}
