//! Data models for expbuddy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{BuddyError, Result};

/// Type tag attached to every hyperparameter at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
    Text,
    Bool,
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Text => "str",
            ParamKind::Bool => "bool",
        }
    }

    /// Parse `raw` strictly as this kind.
    pub fn parse(&self, raw: &str) -> Option<ParamValue> {
        match self {
            ParamKind::Int => raw.parse().ok().map(ParamValue::Int),
            ParamKind::Float => raw.parse().ok().map(ParamValue::Float),
            ParamKind::Text => Some(ParamValue::Text(raw.to_string())),
            ParamKind::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(ParamValue::Bool(true)),
                "false" | "0" | "no" => Some(ParamValue::Bool(false)),
                _ => None,
            },
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar hyperparameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::Float(_) => ParamKind::Float,
            ParamValue::Text(_) => ParamKind::Text,
            ParamValue::Bool(_) => ParamKind::Bool,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            ParamValue::Int(i) => serde_yaml::Value::Number((*i).into()),
            ParamValue::Float(f) => serde_yaml::Value::Number((*f).into()),
            ParamValue::Text(s) => serde_yaml::Value::String(s.clone()),
            ParamValue::Bool(b) => serde_yaml::Value::Bool(*b),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{i}"),
            // Debug keeps the trailing `.0` on integral floats
            ParamValue::Float(v) => write!(f, "{v:?}"),
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}
impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v as f64)
    }
}
impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}
impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v as i64)
    }
}
impl From<usize> for ParamValue {
    fn from(v: usize) -> Self {
        ParamValue::Int(v as i64)
    }
}
impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}
impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}
impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

/// Configuration for a single tracked run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Project the run belongs to (the git repository name)
    pub project: String,
    /// Name of this specific run
    pub run_name: String,
    /// Directory the run writes into
    pub run_dir: PathBuf,
    /// Flush metrics to disk every N rows (default: 50)
    pub flush_interval_rows: usize,
    /// Flush metrics to disk every N milliseconds (default: 500)
    pub flush_interval_ms: u64,
}

impl RunConfig {
    pub fn new(project: impl Into<String>, run_dir: impl Into<PathBuf>) -> Self {
        let now = chrono::Local::now();
        Self {
            project: project.into(),
            run_name: now.format("%Y%m%d_%H%M%S").to_string(),
            run_dir: run_dir.into(),
            flush_interval_rows: 50,
            flush_interval_ms: 500,
        }
    }

    pub fn with_run_name(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = run_name.into();
        self
    }

    pub fn with_flush_interval(mut self, rows: usize, ms: u64) -> Self {
        self.flush_interval_rows = rows;
        self.flush_interval_ms = ms;
        self
    }
}

/// A single logged sample value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Text(String),
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}
impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}
impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(v)
    }
}

/// A row of metrics logged at a specific step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRow {
    pub step: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub values: HashMap<String, MetricValue>,
}

impl MetricRow {
    pub fn new(values: HashMap<String, MetricValue>, step: Option<u64>) -> Self {
        Self {
            step,
            timestamp: Utc::now(),
            values,
        }
    }
}

/// Number of bins used when a histogram is built from raw samples.
pub const DEFAULT_HISTOGRAM_BINS: usize = 64;

/// A binned distribution: `edges.len() == counts.len() + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub counts: Vec<f64>,
    pub edges: Vec<f64>,
}

impl Histogram {
    /// Bin raw samples into `bins` equal-width buckets over `[min, max]`.
    pub fn from_values(values: &[f64], bins: usize) -> Self {
        let bins = bins.max(1);
        let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return Self {
                counts: vec![0.0; bins],
                edges: (0..=bins).map(|i| i as f64 / bins as f64).collect(),
            };
        }

        let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let mut max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if max == min {
            max = min + 1.0;
        }
        // Halved so that `max - min` stays finite for any pair of finite values.
        let half_span = max / 2.0 - min / 2.0;
        let n = bins as f64;
        let edges: Vec<f64> = (0..=bins)
            .map(|i| {
                let t = i as f64 / n;
                min * (1.0 - t) + max * t
            })
            .collect();

        let mut counts = vec![0.0; bins];
        for v in finite {
            let t = (v / 2.0 - min / 2.0) / half_span;
            let idx = ((t * n) as usize).min(bins - 1);
            counts[idx] += 1.0;
        }
        Self { counts, edges }
    }

    /// Accept a precomputed `(counts, edges)` pair.
    pub fn from_binned(counts: Vec<f64>, edges: Vec<f64>) -> Result<Self> {
        if edges.len() != counts.len() + 1 {
            return Err(BuddyError::Other(format!(
                "histogram needs {} edges for {} bins, got {}",
                counts.len() + 1,
                counts.len(),
                edges.len()
            )));
        }
        Ok(Self { counts, edges })
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }
}

/// Histogram input accepted by the reporter.
#[derive(Debug, Clone)]
pub enum HistogramInput {
    Values(Vec<f64>),
    Binned { counts: Vec<f64>, edges: Vec<f64> },
}

impl HistogramInput {
    pub fn into_histogram(self) -> Result<Histogram> {
        match self {
            HistogramInput::Values(v) => Ok(Histogram::from_values(&v, DEFAULT_HISTOGRAM_BINS)),
            HistogramInput::Binned { counts, edges } => Histogram::from_binned(counts, edges),
        }
    }
}

impl From<Vec<f64>> for HistogramInput {
    fn from(v: Vec<f64>) -> Self {
        HistogramInput::Values(v)
    }
}

/// Status of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Crashed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Crashed => write!(f, "CRASHED"),
        }
    }
}

/// Metadata stored alongside a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub name: String,
    pub project: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Last step seen by the engine.
    #[serde(default)]
    pub last_step: Option<u64>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            name: String::new(),
            project: String::new(),
            status: RunStatus::Crashed,
            started_at: Utc::now(),
            finished_at: None,
            duration_secs: None,
            last_step: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_display_keeps_decimal_point() {
        assert_eq!(ParamValue::Float(10.0).to_string(), "10.0");
        assert_eq!(ParamValue::Float(0.01).to_string(), "0.01");
        assert_eq!(ParamValue::Int(10).to_string(), "10");
    }

    #[test]
    fn kind_parse_is_strict() {
        assert_eq!(ParamKind::Int.parse("3"), Some(ParamValue::Int(3)));
        assert_eq!(ParamKind::Int.parse("3.5"), None);
        assert_eq!(ParamKind::Bool.parse("True"), Some(ParamValue::Bool(true)));
        assert_eq!(ParamKind::Bool.parse("maybe"), None);
    }

    #[test]
    fn histogram_from_values_counts_every_sample() {
        let h = Histogram::from_values(&[0.0, 0.5, 1.0, 1.0], 4);
        assert_eq!(h.counts.len(), 4);
        assert_eq!(h.edges.len(), 5);
        assert_eq!(h.total(), 4.0);
        assert_eq!(h.counts[3], 2.0);
    }

    #[test]
    fn histogram_spanning_the_whole_f64_range_stays_finite() {
        for bins in [1, 2, DEFAULT_HISTOGRAM_BINS] {
            let h = Histogram::from_values(&[f64::MIN, 0.0, f64::MAX], bins);
            assert!(h.edges.iter().all(|e| e.is_finite()), "{:?}", h.edges);
            assert_eq!(h.edges[0], f64::MIN);
            assert_eq!(h.edges[bins], f64::MAX);
            assert_eq!(h.total(), 3.0);
            assert_eq!(h.counts[0], if bins == 1 { 3.0 } else { 1.0 });
        }
        let json = serde_json::to_string(&Histogram::from_values(&[f64::MIN, f64::MAX], 8)).unwrap();
        assert!(!json.contains("null"), "{json}");
    }

    #[test]
    fn histogram_from_binned_checks_edges() {
        assert!(Histogram::from_binned(vec![1.0, 2.0], vec![0.0, 1.0, 2.0]).is_ok());
        assert!(Histogram::from_binned(vec![1.0, 2.0], vec![0.0, 1.0]).is_err());
    }
}
