//! Background logging engine behind the local run directory.
//!
//! `LoggingEngine::new()` spawns a task on a dedicated single-worker tokio
//! runtime that owns every file handle. Logging calls are channel sends; the
//! task batches scalar rows and histograms and writes them out periodically,
//! which is what gives `log_scalar` its deferred-commit behaviour.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{error, info};

use crate::error::{BuddyError, Result};
use crate::models::{MetricRow, RunConfig, RunMetadata, RunStatus};
use crate::storage::{self, HistogramRecord};

/// Commands sent to the background task.
enum LogCommand {
    Row(MetricRow),
    /// Replace the persisted config store.
    Config(HashMap<String, String>),
    Histogram(HistogramRecord),
    Figure { path: PathBuf, bytes: Vec<u8> },
    Log { level: LogLevel, message: String },
    Flush(oneshot::Sender<Result<()>>),
    Shutdown {
        status: RunStatus,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Severity of a line in the run log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// The non-blocking engine for one run directory.
pub struct LoggingEngine {
    sender: mpsc::UnboundedSender<LogCommand>,
    runtime: Arc<Runtime>,
    config: RunConfig,
}

impl LoggingEngine {
    /// Create the run directory, write initial metadata and spawn the I/O task.
    pub fn new(config: RunConfig) -> Result<Self> {
        let run_dir = config.run_dir.clone();
        storage::ensure_dir(&run_dir)?;

        let meta = RunMetadata {
            name: config.run_name.clone(),
            project: config.project.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ..Default::default()
        };
        storage::save_run_metadata(&run_dir, &meta)?;

        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("buddy-io")
                .enable_all()
                .build()
                .map_err(|e| BuddyError::Other(e.to_string()))?,
        );

        let (sender, receiver) = mpsc::unbounded_channel::<LogCommand>();
        runtime.spawn(background_task(
            receiver,
            run_dir,
            config.flush_interval_rows.max(1),
            config.flush_interval_ms.max(1),
        ));

        info!(
            project = %config.project,
            run = %config.run_name,
            dir = %config.run_dir.display(),
            "LoggingEngine initialized"
        );

        Ok(Self {
            sender,
            runtime,
            config,
        })
    }

    fn send(&self, cmd: LogCommand) -> Result<()> {
        self.sender.send(cmd).map_err(|_| BuddyError::ChannelClosed)
    }

    pub fn log_row(&self, row: MetricRow) -> Result<()> {
        self.send(LogCommand::Row(row))
    }

    pub fn save_config(&self, config: HashMap<String, String>) -> Result<()> {
        self.send(LogCommand::Config(config))
    }

    pub fn log_histogram(&self, record: HistogramRecord) -> Result<()> {
        self.send(LogCommand::Histogram(record))
    }

    /// Write figure bytes to `path`. Written immediately by the I/O task.
    pub fn save_figure(&self, path: PathBuf, bytes: Vec<u8>) -> Result<()> {
        self.send(LogCommand::Figure { path, bytes })
    }

    pub fn log_message(&self, level: LogLevel, message: impl Into<String>) -> Result<()> {
        self.send(LogCommand::Log {
            level,
            message: message.into(),
        })
    }

    /// Flush buffered rows. Blocks until the I/O task has written them.
    ///
    /// Returns the first write failure since the previous flush, including
    /// config and figure writes.
    pub fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(LogCommand::Flush(tx))?;
        self.runtime
            .block_on(rx)
            .map_err(|_| BuddyError::ChannelClosed)?
    }

    /// Flush everything and write the final status. Blocks until done.
    ///
    /// Reports any write failure not yet returned by [`flush`](Self::flush).
    pub fn close(&self, status: RunStatus) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(LogCommand::Shutdown { status, reply: tx })?;
        self.runtime
            .block_on(rx)
            .map_err(|_| BuddyError::ChannelClosed)?
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn run_dir(&self) -> &Path {
        &self.config.run_dir
    }
}

impl Drop for LoggingEngine {
    fn drop(&mut self) {
        // no-op if close() already ran: the task is gone and the send fails
        let (tx, rx) = oneshot::channel();
        if self
            .send(LogCommand::Shutdown {
                status: RunStatus::Finished,
                reply: tx,
            })
            .is_ok()
        {
            let _ = self
                .runtime
                .block_on(async { tokio::time::timeout(Duration::from_secs(5), rx).await });
        }
    }
}

// ─── Background I/O task ─────────────────────────────────────────────────────

struct Buffers {
    rows: Vec<MetricRow>,
    histograms: Vec<HistogramRecord>,
    log_lines: Vec<String>,
    last_step: Option<u64>,
    /// First write failure not yet reported to the caller.
    failure: Option<BuddyError>,
}

impl Buffers {
    fn record(&mut self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            error!("Failed to write {}: {}", what, e);
            self.failure.get_or_insert(e);
        }
    }

    fn take_failure(&mut self) -> Result<()> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn flush(&mut self, run_dir: &Path) {
        if !self.rows.is_empty() {
            let result = storage::append_metrics(&run_dir.join(storage::METRICS_FILE), &self.rows);
            self.record("metrics", result);
            self.rows.clear();
        }
        if !self.histograms.is_empty() {
            let result = storage::append_histograms(&run_dir.join(storage::HISTOGRAMS_FILE), &self.histograms);
            self.record("histograms", result);
            self.histograms.clear();
        }
        if !self.log_lines.is_empty() {
            let result = append_log(&run_dir.join(storage::LOG_FILE), &self.log_lines);
            self.record("run log", result);
            self.log_lines.clear();
        }
    }
}

async fn background_task(
    mut receiver: mpsc::UnboundedReceiver<LogCommand>,
    run_dir: PathBuf,
    flush_interval_rows: usize,
    flush_interval_ms: u64,
) {
    let mut buffers = Buffers {
        rows: Vec::with_capacity(flush_interval_rows * 2),
        histograms: Vec::new(),
        log_lines: Vec::new(),
        last_step: None,
        failure: None,
    };
    let mut flush_ticker = interval(Duration::from_millis(flush_interval_ms));
    flush_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let started_at = Utc::now();

    loop {
        tokio::select! {
            biased;

            cmd = receiver.recv() => {
                match cmd {
                    None => {
                        buffers.flush(&run_dir);
                        break;
                    }
                    Some(LogCommand::Row(row)) => {
                        if let Some(step) = row.step {
                            buffers.last_step = Some(buffers.last_step.map_or(step, |s| s.max(step)));
                        }
                        buffers.rows.push(row);
                        if buffers.rows.len() >= flush_interval_rows {
                            buffers.flush(&run_dir);
                        }
                    }
                    Some(LogCommand::Config(config)) => {
                        let result = storage::save_config(&run_dir, &config);
                        buffers.record("config", result);
                    }
                    Some(LogCommand::Histogram(record)) => {
                        buffers.histograms.push(record);
                    }
                    Some(LogCommand::Figure { path, bytes }) => {
                        let result = storage::write_figure(&path, &bytes);
                        buffers.record(&format!("figure {}", path.display()), result);
                    }
                    Some(LogCommand::Log { level, message }) => {
                        let ts = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");
                        buffers.log_lines.push(format!("[{ts}] [{}] {message}", level.as_str()));
                        if buffers.log_lines.len() >= 20 {
                            buffers.flush(&run_dir);
                        }
                    }
                    Some(LogCommand::Flush(reply)) => {
                        buffers.flush(&run_dir);
                        let _ = reply.send(buffers.take_failure());
                    }
                    Some(LogCommand::Shutdown { status, reply }) => {
                        buffers.flush(&run_dir);

                        let finished_at = Utc::now();
                        let duration = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;
                        let result = storage::load_run_metadata(&run_dir).and_then(|mut meta| {
                            meta.status = status;
                            meta.finished_at = Some(finished_at);
                            meta.duration_secs = Some(duration);
                            meta.last_step = buffers.last_step;
                            storage::save_run_metadata(&run_dir, &meta)
                        });
                        buffers.record("run metadata", result);

                        let _ = reply.send(buffers.take_failure());
                        break;
                    }
                }
            }

            _ = flush_ticker.tick() => {
                buffers.flush(&run_dir);
            }
        }
    }
}

fn append_log(path: &Path, lines: &[String]) -> Result<()> {
    use std::io::Write;
    let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        writeln!(f, "{line}")?;
    }
    Ok(())
}
