//! Tracking backends the reporter writes to.

use std::collections::HashMap;
use std::path::Path;

use chrono::Utc;
use tracing::debug;

use crate::engine::{LogLevel, LoggingEngine};
use crate::error::Result;
use crate::models::{Histogram, MetricRow, MetricValue, RunConfig, RunStatus};
use crate::storage::{self, HistogramRecord};

/// A figure rendered to bytes, ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedFigure {
    /// File extension of the encoded image, e.g. `"png"` or `"svg"`.
    pub format: String,
    pub bytes: Vec<u8>,
}

impl RenderedFigure {
    pub fn new(format: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            format: format.into(),
            bytes,
        }
    }
}

/// A config store plus a step-indexed sample log.
///
/// Errors from the implementation are returned to the caller unchanged.
pub trait TrackingBackend {
    fn config_get(&self, key: &str) -> Option<String>;

    fn config_contains(&self, key: &str) -> bool {
        self.config_get(key).is_some()
    }

    fn set_config(&mut self, key: &str, value: String) -> Result<()>;

    /// Record a scalar without committing the step.
    fn log_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()>;

    fn log_histogram(&mut self, tag: &str, histogram: &Histogram, step: u64) -> Result<()>;

    fn log_figure(&mut self, tag: &str, figure: &RenderedFigure, step: u64) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Append a line to the run's own log. Backends without one ignore it.
    fn log_message(&mut self, _level: LogLevel, _message: &str) -> Result<()> {
        Ok(())
    }

    /// Mark the run as finished.
    fn finish(&mut self, _status: RunStatus) -> Result<()> {
        Ok(())
    }
}

impl<B: TrackingBackend + ?Sized> TrackingBackend for Box<B> {
    fn config_get(&self, key: &str) -> Option<String> {
        (**self).config_get(key)
    }
    fn config_contains(&self, key: &str) -> bool {
        (**self).config_contains(key)
    }
    fn set_config(&mut self, key: &str, value: String) -> Result<()> {
        (**self).set_config(key, value)
    }
    fn log_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        (**self).log_scalar(tag, value, step)
    }
    fn log_histogram(&mut self, tag: &str, histogram: &Histogram, step: u64) -> Result<()> {
        (**self).log_histogram(tag, histogram, step)
    }
    fn log_figure(&mut self, tag: &str, figure: &RenderedFigure, step: u64) -> Result<()> {
        (**self).log_figure(tag, figure, step)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
    fn log_message(&mut self, level: LogLevel, message: &str) -> Result<()> {
        (**self).log_message(level, message)
    }
    fn finish(&mut self, status: RunStatus) -> Result<()> {
        (**self).finish(status)
    }
}

// ─── Local run directory ─────────────────────────────────────────────────────

/// Writes into a run directory through the background [`LoggingEngine`].
///
/// A `config.yaml` already present in the directory counts as externally
/// preset config.
pub struct LocalBackend {
    engine: LoggingEngine,
    config: HashMap<String, String>,
}

impl LocalBackend {
    pub fn open(run: RunConfig) -> Result<Self> {
        let config = storage::load_config(&run.run_dir)?;
        if !config.is_empty() {
            debug!(keys = config.len(), "loaded preset config");
        }
        let engine = LoggingEngine::new(run)?;
        Ok(Self { engine, config })
    }

    pub fn run_dir(&self) -> &Path {
        self.engine.run_dir()
    }
}

impl TrackingBackend for LocalBackend {
    fn config_get(&self, key: &str) -> Option<String> {
        self.config.get(key).cloned()
    }

    fn set_config(&mut self, key: &str, value: String) -> Result<()> {
        self.config.insert(key.to_string(), value);
        self.engine.save_config(self.config.clone())
    }

    fn log_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        let mut values = HashMap::with_capacity(1);
        values.insert(tag.to_string(), MetricValue::Float(value));
        self.engine.log_row(MetricRow::new(values, Some(step)))
    }

    fn log_histogram(&mut self, tag: &str, histogram: &Histogram, step: u64) -> Result<()> {
        self.engine.log_histogram(HistogramRecord {
            tag: tag.to_string(),
            step,
            timestamp: Utc::now(),
            histogram: histogram.clone(),
        })
    }

    fn log_figure(&mut self, tag: &str, figure: &RenderedFigure, step: u64) -> Result<()> {
        let path = storage::figure_path(self.engine.run_dir(), tag, step, &figure.format);
        self.engine.save_figure(path, figure.bytes.clone())
    }

    fn flush(&mut self) -> Result<()> {
        self.engine.flush()
    }

    fn log_message(&mut self, level: LogLevel, message: &str) -> Result<()> {
        self.engine.log_message(level, message)
    }

    fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.engine.close(status)
    }
}

// ─── In-memory ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ScalarSample {
    pub tag: String,
    pub value: f64,
    pub step: u64,
}

/// Keeps everything in memory. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    pub config: HashMap<String, String>,
    pub scalars: Vec<ScalarSample>,
    pub histograms: Vec<(String, Histogram, u64)>,
    pub figures: Vec<(String, RenderedFigure, u64)>,
    pub messages: Vec<(LogLevel, String)>,
    pub flushes: usize,
    pub status: Option<RunStatus>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed config keys, as a sweep controller would before the run starts.
    pub fn with_preset(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

impl TrackingBackend for MemoryBackend {
    fn config_get(&self, key: &str) -> Option<String> {
        self.config.get(key).cloned()
    }

    fn set_config(&mut self, key: &str, value: String) -> Result<()> {
        self.config.insert(key.to_string(), value);
        Ok(())
    }

    fn log_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.scalars.push(ScalarSample {
            tag: tag.to_string(),
            value,
            step,
        });
        Ok(())
    }

    fn log_histogram(&mut self, tag: &str, histogram: &Histogram, step: u64) -> Result<()> {
        self.histograms.push((tag.to_string(), histogram.clone(), step));
        Ok(())
    }

    fn log_figure(&mut self, tag: &str, figure: &RenderedFigure, step: u64) -> Result<()> {
        self.figures.push((tag.to_string(), figure.clone(), step));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }

    fn log_message(&mut self, level: LogLevel, message: &str) -> Result<()> {
        self.messages.push((level, message.to_string()));
        Ok(())
    }

    fn finish(&mut self, status: RunStatus) -> Result<()> {
        self.status = Some(status);
        Ok(())
    }
}
