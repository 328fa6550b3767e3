//! Run directory storage: Parquet scalars, YAML config and metadata,
//! JSON-lines histograms and rendered figures.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::Serialize;

use crate::error::{BuddyError, Result};
use crate::models::{Histogram, MetricRow, MetricValue, RunMetadata, RunStatus};

pub const METRICS_FILE: &str = "metrics.parquet";
pub const CONFIG_FILE: &str = "config.yaml";
pub const RUN_FILE: &str = "run.yaml";
pub const LOG_FILE: &str = "run.log";
pub const HISTOGRAMS_FILE: &str = "histograms.jsonl";
pub const FIGURES_DIR: &str = "figures";

// ─── Directory helpers ────────────────────────────────────────────────────────

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// File name for a figure logged under `tag` at `step`.
pub fn figure_path(run_dir: &Path, tag: &str, step: u64, ext: &str) -> PathBuf {
    let safe: String = tag
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    run_dir.join(FIGURES_DIR).join(format!("{safe}-{step}.{ext}"))
}

// ─── YAML I/O ────────────────────────────────────────────────────────────────

pub fn save_yaml<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let content = serde_yaml::to_string(data)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_yaml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

pub fn load_yaml_value(path: &Path) -> Result<serde_yaml::Value> {
    if !path.exists() {
        return Ok(serde_yaml::Value::Mapping(Default::default()));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Load the run's config store. Scalars are read back as strings; keys with
/// null or nested values are skipped.
pub fn load_config(run_dir: &Path) -> Result<HashMap<String, String>> {
    let serde_yaml::Value::Mapping(mapping) = load_yaml_value(&run_dir.join(CONFIG_FILE))? else {
        return Ok(HashMap::new());
    };
    Ok(mapping
        .iter()
        .filter_map(|(k, v)| Some((scalar_string(k)?, scalar_string(v)?)))
        .collect())
}

fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub fn save_config(run_dir: &Path, config: &HashMap<String, String>) -> Result<()> {
    // sorted for stable diffs between runs
    let sorted: std::collections::BTreeMap<_, _> = config.iter().collect();
    save_yaml(&run_dir.join(CONFIG_FILE), &sorted)
}

pub fn save_run_metadata(run_dir: &Path, meta: &RunMetadata) -> Result<()> {
    save_yaml(&run_dir.join(RUN_FILE), meta)
}

pub fn load_run_metadata(run_dir: &Path) -> Result<RunMetadata> {
    let path = run_dir.join(RUN_FILE);
    if !path.exists() {
        let name = run_dir
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        return Ok(RunMetadata {
            name,
            status: RunStatus::Crashed,
            ..Default::default()
        });
    }
    let content = fs::read_to_string(&path)?;
    Ok(serde_yaml::from_str(&content)?)
}

// ─── Histograms and figures ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct HistogramRecord {
    pub tag: String,
    pub step: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub histogram: Histogram,
}

pub fn append_histograms(path: &Path, records: &[HistogramRecord]) -> Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    for record in records {
        writeln!(f, "{}", serde_json::to_string(record)?)?;
    }
    Ok(())
}

pub fn read_histograms(path: &Path) -> Result<Vec<HistogramRecord>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(BuddyError::from))
        .collect()
}

pub fn write_figure(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

// ─── Parquet metrics I/O ─────────────────────────────────────────────────────

fn base_fields() -> Vec<Field> {
    vec![
        Field::new("step", DataType::Int64, true),
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
    ]
}

/// Append metric rows to a Parquet file.
///
/// The existing file is read, concatenated and rewritten. Rows arrive in
/// batches from the engine so this stays infrequent.
pub fn append_metrics(path: &Path, rows: &[MetricRow]) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let new_batch = rows_to_record_batch(rows)?;
    let batch = if path.exists() {
        concat_batches(&read_parquet(path)?, &new_batch)?
    } else {
        new_batch
    };
    write_parquet(path, &batch)
}

/// Read all metrics as row maps.
pub fn read_metrics(path: &Path) -> Result<Vec<HashMap<String, serde_json::Value>>> {
    if !path.exists() {
        return Ok(vec![]);
    }
    let batch = read_parquet(path)?;
    record_batch_to_rows(&batch)
}

fn read_parquet(path: &Path) -> Result<RecordBatch> {
    let file = fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;
    let mut batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    match batches.len() {
        0 => Ok(RecordBatch::new_empty(Arc::new(Schema::new(base_fields())))),
        1 => Ok(batches.remove(0)),
        _ => {
            let schema = batches[0].schema();
            Ok(arrow::compute::concat_batches(&schema, &batches)?)
        }
    }
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = fs::File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Concatenate two batches whose columns may differ; missing cells become null.
fn concat_batches(existing: &RecordBatch, new: &RecordBatch) -> Result<RecordBatch> {
    let mut fields: Vec<Field> = existing.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    for field in new.schema().fields() {
        if !fields.iter().any(|f| f.name() == field.name()) {
            fields.push(field.as_ref().clone());
        }
    }
    let schema = Arc::new(Schema::new(fields));
    let a = align_batch(existing, &schema)?;
    let b = align_batch(new, &schema)?;
    Ok(arrow::compute::concat_batches(&schema, &[a, b])?)
}

fn align_batch(batch: &RecordBatch, schema: &Arc<Schema>) -> Result<RecordBatch> {
    let n = batch.num_rows();
    let columns: Vec<ArrayRef> = schema
        .fields()
        .iter()
        .map(|field| match batch.column_by_name(field.name()) {
            Some(col) => col.clone(),
            None => null_column(field.data_type(), n),
        })
        .collect();
    Ok(RecordBatch::try_new(schema.clone(), columns)?)
}

fn null_column(data_type: &DataType, n: usize) -> ArrayRef {
    match data_type {
        DataType::Float64 => Arc::new(Float64Array::from(vec![None::<f64>; n])),
        DataType::Int64 => Arc::new(Int64Array::from(vec![None::<i64>; n])),
        DataType::Timestamp(TimeUnit::Microsecond, _) => Arc::new(
            TimestampMicrosecondArray::from(vec![None::<i64>; n])
                .with_timezone_opt(Some("UTC".to_string())),
        ),
        _ => Arc::new(StringArray::from(vec![None::<&str>; n])),
    }
}

fn rows_to_record_batch(rows: &[MetricRow]) -> Result<RecordBatch> {
    let mut keys: Vec<&String> = vec![];
    for row in rows {
        for key in row.values.keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    let mut fields = base_fields();
    let mut arrays: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(
            rows.iter().map(|r| r.step.map(|s| s as i64)).collect::<Vec<_>>(),
        )),
        Arc::new(
            TimestampMicrosecondArray::from(
                rows.iter()
                    .map(|r| Some(r.timestamp.timestamp_micros()))
                    .collect::<Vec<_>>(),
            )
            .with_timezone_opt(Some("UTC".to_string())),
        ),
    ];

    for key in keys {
        let numeric = matches!(
            rows.iter().find_map(|r| r.values.get(key)),
            Some(MetricValue::Float(_)) | Some(MetricValue::Int(_))
        );
        if numeric {
            let vals: Vec<Option<f64>> = rows
                .iter()
                .map(|r| match r.values.get(key) {
                    Some(MetricValue::Float(f)) => Some(*f),
                    Some(MetricValue::Int(i)) => Some(*i as f64),
                    _ => None,
                })
                .collect();
            fields.push(Field::new(key, DataType::Float64, true));
            arrays.push(Arc::new(Float64Array::from(vals)));
        } else {
            let vals: Vec<Option<String>> = rows
                .iter()
                .map(|r| {
                    r.values.get(key).map(|v| match v {
                        MetricValue::Text(s) => s.clone(),
                        MetricValue::Bool(b) => b.to_string(),
                        MetricValue::Float(f) => f.to_string(),
                        MetricValue::Int(i) => i.to_string(),
                    })
                })
                .collect();
            fields.push(Field::new(key, DataType::Utf8, true));
            arrays.push(Arc::new(StringArray::from(vals)));
        }
    }

    Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays)?)
}

fn record_batch_to_rows(batch: &RecordBatch) -> Result<Vec<HashMap<String, serde_json::Value>>> {
    let schema = batch.schema();
    let mut rows = vec![HashMap::new(); batch.num_rows()];

    for (field, col) in schema.fields().iter().zip(batch.columns()) {
        for (idx, row) in rows.iter_mut().enumerate() {
            let val = if col.is_null(idx) {
                serde_json::Value::Null
            } else {
                cell_to_json(col, field.data_type(), idx)
            };
            row.insert(field.name().clone(), val);
        }
    }
    Ok(rows)
}

fn cell_to_json(col: &ArrayRef, data_type: &DataType, idx: usize) -> serde_json::Value {
    match data_type {
        DataType::Float64 => col
            .as_any()
            .downcast_ref::<Float64Array>()
            .map(|a| a.value(idx))
            .filter(|f| f.is_finite())
            .map(|f| serde_json::json!(f))
            .unwrap_or(serde_json::Value::Null),
        DataType::Int64 => col
            .as_any()
            .downcast_ref::<Int64Array>()
            .map(|a| serde_json::json!(a.value(idx)))
            .unwrap_or(serde_json::Value::Null),
        DataType::Timestamp(TimeUnit::Microsecond, _) => col
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|a| DateTime::<Utc>::from_timestamp_micros(a.value(idx)))
            .map(|dt| serde_json::json!(dt.to_rfc3339()))
            .unwrap_or(serde_json::Value::Null),
        DataType::Utf8 => col
            .as_any()
            .downcast_ref::<StringArray>()
            .map(|a| serde_json::json!(a.value(idx)))
            .unwrap_or(serde_json::Value::Null),
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(step: u64, pairs: &[(&str, f64)]) -> MetricRow {
        let values = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), MetricValue::Float(*v)))
            .collect();
        MetricRow::new(values, Some(step))
    }

    #[test]
    fn append_merges_new_columns() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(METRICS_FILE);
        append_metrics(&path, &[row(0, &[("loss", 0.5)])]).unwrap();
        append_metrics(&path, &[row(1, &[("loss", 0.4), ("acc", 0.8)])]).unwrap();

        let rows = read_metrics(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].get("acc").map(|v| v.is_null()).unwrap_or(true));
        assert_eq!(rows[1].get("acc").and_then(|v| v.as_f64()), Some(0.8));
        assert_eq!(rows[1].get("step").and_then(|v| v.as_i64()), Some(1));
    }

    #[test]
    fn config_round_trips_as_strings() {
        let tmp = TempDir::new().unwrap();
        let mut config = HashMap::new();
        config.insert("^lr".to_string(), "0.01".to_string());
        save_config(tmp.path(), &config).unwrap();
        assert_eq!(load_config(tmp.path()).unwrap(), config);
    }

    #[test]
    fn unquoted_scalars_load_as_strings() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), "^lr: 0.5\n^epochs: 3\n^debug: true\n^nested: [1]\n").unwrap();
        let config = load_config(tmp.path()).unwrap();
        assert_eq!(config.get("^lr").map(String::as_str), Some("0.5"));
        assert_eq!(config.get("^epochs").map(String::as_str), Some("3"));
        assert_eq!(config.get("^debug").map(String::as_str), Some("true"));
        assert!(!config.contains_key("^nested"));
    }

    #[test]
    fn figure_path_sanitizes_tag() {
        let p = figure_path(Path::new("/run"), "eval/confusion matrix", 3, "png");
        assert_eq!(p, Path::new("/run/figures/eval_confusion_matrix-3.png"));
    }

    #[test]
    fn missing_metadata_is_crashed() {
        let tmp = TempDir::new().unwrap();
        let meta = load_run_metadata(tmp.path()).unwrap();
        assert_eq!(meta.status, RunStatus::Crashed);
    }
}
