//! End-to-end tests for the reporter writing into a local run directory.

use expbuddy::models::{Histogram, RunMetadata};
use expbuddy::params::ExtraModule;
use expbuddy::storage::{self, CONFIG_FILE, FIGURES_DIR, HISTOGRAMS_FILE, METRICS_FILE};
use expbuddy::{
    HistogramInput, HyperparameterSet, LocalBackend, RenderedFigure, RunConfig, RunReporter, RunStatus,
};
use tempfile::TempDir;

fn open_backend(tmp: &TempDir) -> LocalBackend {
    let run = RunConfig::new("demo", tmp.path().join("run"))
        .with_run_name("lr_sweep_Jan01_12-00-00")
        .with_flush_interval(10, 100);
    LocalBackend::open(run).expect("Failed to open LocalBackend")
}

fn params() -> HyperparameterSet {
    let mut set = HyperparameterSet::new().with("lr", 0.01).with("epochs", 10);
    set.add_extra_module(ExtraModule::new("torch.optim").attr("momentum", 0.9).attr("_hidden", 1));
    set
}

#[test]
fn test_params_land_in_config_yaml() {
    let tmp = TempDir::new().unwrap();
    let reporter = RunReporter::new("run", "demo", &params(), open_backend(&tmp)).unwrap();
    let backend = reporter.finish(RunStatus::Finished).unwrap();

    let config = storage::load_config(backend.run_dir()).unwrap();
    assert_eq!(config.get("^lr").map(String::as_str), Some("0.01"));
    assert_eq!(config.get("^epochs").map(String::as_str), Some("10"));
    assert_eq!(config.get("torch_optim^momentum").map(String::as_str), Some("0.9"));
    assert!(!config.contains_key("torch_optim^_hidden"));
}

#[test]
fn test_preset_config_is_not_overwritten() {
    let tmp = TempDir::new().unwrap();
    let run_dir = tmp.path().join("run");
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(run_dir.join(CONFIG_FILE), "^lr: 0.5\n").unwrap();

    let reporter = RunReporter::new("run", "demo", &params(), open_backend(&tmp)).unwrap();
    let backend = reporter.finish(RunStatus::Finished).unwrap();

    let config = storage::load_config(backend.run_dir()).unwrap();
    assert_eq!(config.get("^lr").map(String::as_str), Some("0.5"));
    assert_eq!(config.get("^epochs").map(String::as_str), Some("10"));
}

#[test]
fn test_scalars_written_to_parquet() {
    let tmp = TempDir::new().unwrap();
    let mut reporter = RunReporter::new("run", "demo", &HyperparameterSet::new(), open_backend(&tmp)).unwrap();

    for _ in 0..25 {
        let step = reporter.step();
        reporter.log_scalar("loss", 1.0 / step as f64, step).unwrap();
    }
    reporter.flush().unwrap();

    let rows = storage::read_metrics(&reporter.backend().run_dir().join(METRICS_FILE)).unwrap();
    assert_eq!(rows.len(), 25);
    assert_eq!(rows[0].get("step").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(rows[24].get("loss").and_then(|v| v.as_f64()), Some(1.0 / 25.0));

    let backend = reporter.finish(RunStatus::Finished).unwrap();
    let meta: RunMetadata = storage::load_run_metadata(backend.run_dir()).unwrap();
    assert_eq!(meta.status, RunStatus::Finished);
    assert_eq!(meta.last_step, Some(25));
    assert!(meta.duration_secs.is_some());
}

#[test]
fn test_histograms_written_as_json_lines() {
    let tmp = TempDir::new().unwrap();
    let mut reporter = RunReporter::new("run", "demo", &HyperparameterSet::new(), open_backend(&tmp)).unwrap();

    reporter.log_histogram("weights", vec![0.0, 0.5, 1.0, 1.0], 1).unwrap();
    let binned = HistogramInput::Binned {
        counts: vec![3.0, 1.0],
        edges: vec![0.0, 1.0, 2.0],
    };
    reporter.log_histogram("grads", binned, 2).unwrap();
    let backend = reporter.finish(RunStatus::Finished).unwrap();

    let records = storage::read_histograms(&backend.run_dir().join(HISTOGRAMS_FILE)).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].tag, "weights");
    assert_eq!(records[0].histogram.total(), 4.0);
    assert_eq!(
        records[1].histogram,
        Histogram::from_binned(vec![3.0, 1.0], vec![0.0, 1.0, 2.0]).unwrap()
    );
}

#[test]
fn test_bad_bin_edges_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut reporter = RunReporter::new("run", "demo", &HyperparameterSet::new(), open_backend(&tmp)).unwrap();
    let binned = HistogramInput::Binned {
        counts: vec![3.0, 1.0],
        edges: vec![0.0, 1.0],
    };
    assert!(reporter.log_histogram("grads", binned, 1).is_err());
    reporter.finish(RunStatus::Failed).unwrap();
}

#[test]
fn test_figures_written_to_disk() {
    let tmp = TempDir::new().unwrap();
    let mut reporter = RunReporter::new("run", "demo", &HyperparameterSet::new(), open_backend(&tmp)).unwrap();

    let figure = RenderedFigure::new("svg", b"<svg/>".to_vec());
    let kept = reporter.log_figure("eval/curve", figure, 7, false).unwrap();
    assert!(kept.is_some());
    let backend = reporter.finish(RunStatus::Finished).unwrap();

    let path = backend.run_dir().join(FIGURES_DIR).join("eval_curve-7.svg");
    assert_eq!(std::fs::read(path).unwrap(), b"<svg/>");
}

#[test]
fn test_config_notices_written_to_run_log() {
    let tmp = TempDir::new().unwrap();
    let reporter = RunReporter::new("run", "demo", &params(), open_backend(&tmp)).unwrap();
    let backend = reporter.finish(RunStatus::Finished).unwrap();

    let log = std::fs::read_to_string(backend.run_dir().join(storage::LOG_FILE)).unwrap();
    assert!(log.contains("[INFO] setting ^lr=0.01"), "got {log}");
    assert!(log.contains("[INFO] setting torch_optim^momentum=0.9"), "got {log}");
    assert!(log.contains("run finished with status FINISHED"), "got {log}");
}

#[test]
fn test_figure_write_failure_surfaces_on_flush() {
    let tmp = TempDir::new().unwrap();
    let mut reporter = RunReporter::new("run", "demo", &HyperparameterSet::new(), open_backend(&tmp)).unwrap();
    // a plain file where the figures directory should go
    std::fs::write(reporter.backend().run_dir().join(FIGURES_DIR), "").unwrap();

    let figure = RenderedFigure::new("svg", b"<svg/>".to_vec());
    reporter.log_figure("curve", figure, 1, true).unwrap();
    assert!(reporter.flush().is_err());
    // reported once
    reporter.finish(RunStatus::Finished).unwrap();
}

#[test]
fn test_config_write_failure_surfaces_on_finish() {
    let tmp = TempDir::new().unwrap();
    let backend = open_backend(&tmp);
    std::fs::create_dir_all(backend.run_dir().join(CONFIG_FILE)).unwrap();

    let reporter = RunReporter::new("run", "demo", &params(), backend).unwrap();
    assert!(reporter.finish(RunStatus::Finished).is_err());
}

#[test]
fn test_metrics_write_failure_surfaces_on_flush() {
    let tmp = TempDir::new().unwrap();
    let mut reporter = RunReporter::new("run", "demo", &HyperparameterSet::new(), open_backend(&tmp)).unwrap();
    std::fs::create_dir_all(reporter.backend().run_dir().join(METRICS_FILE)).unwrap();

    reporter.log_scalar("loss", 0.5, 1).unwrap();
    assert!(reporter.flush().is_err());
    reporter.finish(RunStatus::Failed).unwrap();
}
