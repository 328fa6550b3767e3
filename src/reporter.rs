//! Run reporter: pushes hyperparameters to a tracking backend and forwards
//! scalars, histograms and figures to it.

use tracing::{debug, info};

use crate::backend::{RenderedFigure, TrackingBackend};
use crate::engine::LogLevel;
use crate::error::Result;
use crate::models::{HistogramInput, ParamValue, RunStatus};
use crate::params::{HyperparameterSet, ESCAPE_PREFIX};

/// A figure that can be rendered for logging and released afterwards.
pub trait Figure {
    fn render(&self) -> Result<RenderedFigure>;

    /// Release any resources held by the figure.
    fn close(self)
    where
        Self: Sized,
    {
    }
}

impl Figure for RenderedFigure {
    fn render(&self) -> Result<RenderedFigure> {
        Ok(self.clone())
    }
}

/// Identity of a live run and its step counter.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContext {
    pub run_name: String,
    pub project: String,
    step: u64,
}

impl RunContext {
    pub fn new(run_name: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            run_name: run_name.into(),
            project: project.into(),
            step: 0,
        }
    }

    pub fn global_step(&self) -> u64 {
        self.step
    }
}

/// Config-store key for a top-level hyperparameter or a module attribute.
pub fn config_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{ESCAPE_PREFIX}{name}")
}

pub struct RunReporter<B: TrackingBackend> {
    context: RunContext,
    backend: B,
    mirror: Option<Box<dyn TrackingBackend>>,
}

impl<B: TrackingBackend> RunReporter<B> {
    /// Bind a run to `backend` and push every hyperparameter to its config store.
    pub fn new(
        run_name: impl Into<String>,
        project: impl Into<String>,
        params: &HyperparameterSet,
        backend: B,
    ) -> Result<Self> {
        let context = RunContext::new(run_name, project);
        info!(project = %context.project, run = %context.run_name, "starting run");
        let mut reporter = Self {
            context,
            backend,
            mirror: None,
        };
        reporter.register_params(params)?;
        Ok(reporter)
    }

    /// Also send every sample to `mirror`, e.g. a local run directory.
    pub fn with_mirror(mut self, mirror: Box<dyn TrackingBackend>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn register_params(&mut self, params: &HyperparameterSet) -> Result<()> {
        for (name, value) in params.iter() {
            self.register_param(&config_key("", name), value)?;
        }
        for module in params.extra_modules() {
            let prefix = module.key_prefix();
            for (name, value) in module.public_attributes() {
                self.register_param(&config_key(&prefix, name), value)?;
            }
        }
        Ok(())
    }

    fn register_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        // keys preset by a sweep controller win
        match self.backend.config_get(key) {
            None => {
                let notice = format!("setting {key}={value}");
                info!("{}", notice);
                self.backend.set_config(key, value.to_string())?;
                self.backend.log_message(LogLevel::Info, &notice)
            }
            Some(existing) => {
                let notice = format!("not setting {key} to {value}, it is already {existing}");
                info!("{}", notice);
                self.backend.log_message(LogLevel::Warn, &notice)
            }
        }
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    pub fn global_step(&self) -> u64 {
        self.context.step
    }

    pub fn set_global_step(&mut self, step: u64) {
        self.context.step = step;
    }

    /// Advance the step counter by one and return the new value.
    pub fn step(&mut self) -> u64 {
        self.context.step += 1;
        self.context.step
    }

    pub fn log_scalar(&mut self, tag: &str, value: f64, step: u64) -> Result<()> {
        self.backend.log_scalar(tag, value, step)?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.log_scalar(tag, value, step)?;
        }
        Ok(())
    }

    pub fn log_histogram(&mut self, tag: &str, values: impl Into<HistogramInput>, step: u64) -> Result<()> {
        let histogram = values.into().into_histogram()?;
        self.backend.log_histogram(tag, &histogram, step)?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.log_histogram(tag, &histogram, step)?;
        }
        Ok(())
    }

    /// Log a rendered figure. With `close` the figure is released and `None`
    /// is returned; otherwise it is handed back to the caller.
    pub fn log_figure<F: Figure>(&mut self, tag: &str, figure: F, step: u64, close: bool) -> Result<Option<F>> {
        let rendered = figure.render()?;
        self.backend.log_figure(tag, &rendered, step)?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.log_figure(tag, &rendered, step)?;
        }
        if close {
            figure.close();
            return Ok(None);
        }
        Ok(Some(figure))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.backend.flush()?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.flush()?;
        }
        Ok(())
    }

    /// Finish the run and hand the backend back.
    pub fn finish(mut self, status: RunStatus) -> Result<B> {
        debug!(run = %self.context.run_name, %status, "finishing run");
        let level = match status {
            RunStatus::Finished => LogLevel::Info,
            _ => LogLevel::Error,
        };
        self.backend.log_message(level, &format!("run finished with status {status}"))?;
        self.backend.finish(status.clone())?;
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.finish(status)?;
        }
        Ok(self.backend)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::models::Histogram;
    use crate::params::{Binding, ExtraModule};
    use std::cell::Cell;
    use std::rc::Rc;

    fn params() -> HyperparameterSet {
        HyperparameterSet::new().with("lr", 0.01).with("epochs", 10)
    }

    #[test]
    fn params_are_pushed_as_strings_with_escape_prefix() {
        let reporter = RunReporter::new("run", "proj", &params(), MemoryBackend::new()).unwrap();
        let config = &reporter.backend().config;
        assert_eq!(config.get("^lr").map(String::as_str), Some("0.01"));
        assert_eq!(config.get("^epochs").map(String::as_str), Some("10"));
    }

    #[test]
    fn preset_keys_are_not_overwritten() {
        let backend = MemoryBackend::new().with_preset("^lr", "0.5");
        let reporter = RunReporter::new("run", "proj", &params(), backend).unwrap();
        let config = &reporter.backend().config;
        assert_eq!(config.get("^lr").map(String::as_str), Some("0.5"));
        assert_eq!(config.get("^epochs").map(String::as_str), Some("10"));
    }

    #[test]
    fn config_notices_go_to_the_run_log() {
        let backend = MemoryBackend::new().with_preset("^lr", "0.5");
        let reporter = RunReporter::new("run", "proj", &params(), backend).unwrap();
        let backend = reporter.finish(RunStatus::Failed).unwrap();
        assert_eq!(
            backend.messages,
            vec![
                (LogLevel::Warn, "not setting ^lr to 0.01, it is already 0.5".to_string()),
                (LogLevel::Info, "setting ^epochs=10".to_string()),
                (LogLevel::Error, "run finished with status FAILED".to_string()),
            ]
        );
    }

    #[test]
    fn extra_modules_are_flattened_under_module_prefix() {
        let mut set = params();
        set.add_extra_module(
            ExtraModule::new("configs.optim")
                .attr("beta", 0.9)
                .attr("__file__", "optim.rs")
                .attr("build", Binding::Callable),
        );
        let reporter = RunReporter::new("run", "proj", &set, MemoryBackend::new()).unwrap();
        let config = &reporter.backend().config;
        assert_eq!(config.get("configs_optim^beta").map(String::as_str), Some("0.9"));
        assert_eq!(config.len(), 3);
    }

    #[test]
    fn global_step_is_settable() {
        let mut reporter = RunReporter::new("run", "proj", &params(), MemoryBackend::new()).unwrap();
        assert_eq!(reporter.global_step(), 0);
        reporter.set_global_step(41);
        assert_eq!(reporter.step(), 42);
        assert_eq!(reporter.context().global_step(), 42);
    }

    #[test]
    fn scalars_are_not_flushed() {
        let mut reporter = RunReporter::new("run", "proj", &params(), MemoryBackend::new()).unwrap();
        reporter.log_scalar("loss", 0.25, 3).unwrap();
        let backend = reporter.backend();
        assert_eq!(backend.scalars.len(), 1);
        assert_eq!(backend.scalars[0].step, 3);
        assert_eq!(backend.flushes, 0);
    }

    #[test]
    fn histogram_accepts_values_and_binned_pairs() {
        let mut reporter = RunReporter::new("run", "proj", &params(), MemoryBackend::new()).unwrap();
        reporter.log_histogram("w", vec![0.0, 1.0, 2.0], 1).unwrap();
        reporter
            .log_histogram(
                "g",
                HistogramInput::Binned {
                    counts: vec![2.0, 3.0],
                    edges: vec![0.0, 0.5, 1.0],
                },
                1,
            )
            .unwrap();
        let h = &reporter.backend().histograms;
        assert_eq!(h[0].1.total(), 3.0);
        assert_eq!(h[1].1, Histogram::from_binned(vec![2.0, 3.0], vec![0.0, 0.5, 1.0]).unwrap());
    }

    struct TrackedFigure {
        closed: Rc<Cell<bool>>,
    }

    impl Figure for TrackedFigure {
        fn render(&self) -> Result<RenderedFigure> {
            Ok(RenderedFigure::new("svg", b"<svg/>".to_vec()))
        }

        fn close(self) {
            self.closed.set(true);
        }
    }

    #[test]
    fn figures_are_closed_by_default() {
        let closed = Rc::new(Cell::new(false));
        let mut reporter = RunReporter::new("run", "proj", &params(), MemoryBackend::new()).unwrap();

        let fig = TrackedFigure { closed: closed.clone() };
        let kept = reporter.log_figure("plot", fig, 2, true).unwrap();
        assert!(kept.is_none());
        assert!(closed.get());

        let other = Rc::new(Cell::new(false));
        let fig = TrackedFigure { closed: other.clone() };
        let kept = reporter.log_figure("plot", fig, 3, false).unwrap();
        assert!(kept.is_some());
        assert!(!other.get());
        assert_eq!(reporter.backend().figures.len(), 2);
    }

    #[test]
    fn mirror_receives_samples() {
        let mut reporter = RunReporter::new("run", "proj", &params(), MemoryBackend::new())
            .unwrap()
            .with_mirror(Box::new(MemoryBackend::new()));
        reporter.log_scalar("loss", 1.0, 0).unwrap();
        reporter.flush().unwrap();
        let backend = reporter.finish(RunStatus::Finished).unwrap();
        assert_eq!(backend.status, Some(RunStatus::Finished));
        assert_eq!(backend.flushes, 1);
    }
}
