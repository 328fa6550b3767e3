//! Deploy dispatcher.
//!
//! Decides from the environment whether this process is a scheduler-managed
//! job, a debug run, an interactive local run or a submission to a cluster,
//! and builds the matching reporter (or submits the job).

use std::path::PathBuf;

use chrono::Local;
use tracing::{info, warn};

use crate::backend::{LocalBackend, TrackingBackend};
use crate::config::BuddyConfig;
use crate::error::{BuddyError, Result};
use crate::git::GitRepo;
use crate::models::RunConfig;
use crate::params::HyperparameterSet;
use crate::prompt::{ask_run_id, RunIdPrompt, StdinPrompt};
use crate::remote::{self, JobSpec, RemoteShell, SshRemote, Submission};
use crate::reporter::RunReporter;

pub const DEBUG_RUN_ID: &str = "DEBUG_RUN";
const TIMESTAMP_FORMAT: &str = "%b%d_%H-%M-%S";

/// What the dispatcher needs to know about the current process.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Job id assigned by the cluster scheduler.
    pub job_id: Option<String>,
    /// Set by the remote scripts when the job was deployed by us.
    pub deployed: bool,
    pub debug: bool,
    pub testing_branch: Option<String>,
    /// Path of the running entry point (argv[0]).
    pub entrypoint: PathBuf,
    /// Directory the repository search starts from.
    pub cwd: PathBuf,
}

impl Environment {
    pub fn capture(job_id_var: &str) -> Result<Self> {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Ok(Self {
            job_id: non_empty(job_id_var),
            deployed: non_empty("BUDDY_IS_DEPLOYED").is_some(),
            debug: non_empty("BUDDY_DEBUG")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no"))
                .unwrap_or(false),
            testing_branch: non_empty("BUDDY_CURRENT_TESTING_BRANCH"),
            entrypoint: std::env::args_os().next().map(PathBuf::from).unwrap_or_default(),
            cwd: std::env::current_dir()?,
        })
    }

    pub fn is_scheduled(&self) -> bool {
        self.job_id.is_some() || self.deployed
    }
}

#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Cluster host; `None` runs locally.
    pub host: Option<String>,
    pub sweep_yaml: Option<PathBuf>,
    pub proc_num: usize,
    /// Extra `#SBATCH` lines for the job scripts.
    pub extra_headers: String,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            host: None,
            sweep_yaml: None,
            proc_num: 1,
            extra_headers: String::new(),
        }
    }
}

impl DeployOptions {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn cluster(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            ..Self::default()
        }
    }
}

pub type Reporter = RunReporter<Box<dyn TrackingBackend>>;

pub enum Deployment {
    /// Log from this process.
    Tracked(Reporter),
    /// The job now runs remotely; this process should exit.
    Submitted(Submission),
}

/// Creates the backends the dispatcher hands to reporters.
pub trait BackendFactory {
    /// Backend for a run started by the scheduler.
    fn tracking(&self, run: RunConfig) -> Result<Box<dyn TrackingBackend>>;

    /// Local log writer.
    fn local(&self, run: RunConfig) -> Result<Box<dyn TrackingBackend>>;
}

/// Both kinds of run write to a local run directory.
#[derive(Debug, Default)]
pub struct LocalBackends;

impl BackendFactory for LocalBackends {
    fn tracking(&self, run: RunConfig) -> Result<Box<dyn TrackingBackend>> {
        Ok(Box::new(LocalBackend::open(run)?))
    }

    fn local(&self, run: RunConfig) -> Result<Box<dyn TrackingBackend>> {
        Ok(Box::new(LocalBackend::open(run)?))
    }
}

type Connector = Box<dyn FnMut(&str) -> Result<Box<dyn RemoteShell>>>;

pub struct Dispatcher {
    config: BuddyConfig,
    prompt: Box<dyn RunIdPrompt>,
    backends: Box<dyn BackendFactory>,
    connect: Connector,
}

impl Dispatcher {
    pub fn new(config: BuddyConfig) -> Self {
        Self {
            config,
            prompt: Box::new(StdinPrompt),
            backends: Box::new(LocalBackends),
            connect: Box::new(|host: &str| Ok(Box::new(SshRemote::open(host)?) as Box<dyn RemoteShell>)),
        }
    }

    pub fn with_prompt(mut self, prompt: impl RunIdPrompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    pub fn with_backends(mut self, backends: impl BackendFactory + 'static) -> Self {
        self.backends = Box::new(backends);
        self
    }

    pub fn with_connector<F>(mut self, connect: F) -> Self
    where
        F: FnMut(&str) -> Result<Box<dyn RemoteShell>> + 'static,
    {
        self.connect = Box::new(connect);
        self
    }

    pub fn config(&self) -> &BuddyConfig {
        &self.config
    }

    pub fn deploy(
        &mut self,
        params: &HyperparameterSet,
        env: &Environment,
        opts: &DeployOptions,
    ) -> Result<Deployment> {
        let repo = GitRepo::discover(&env.cwd)?;

        if opts.host.is_none() && opts.sweep_yaml.is_some() {
            return Err(BuddyError::UnsupportedCombination(
                "Local sweeps are not supported".to_string(),
            ));
        }

        let project = project_name(&repo);
        let dtm = Local::now().format(TIMESTAMP_FORMAT).to_string();

        if env.is_scheduled() {
            info!("using the tracking backend");
            let message = repo.head_message()?;
            let run_name = format!("{}_{}{}", message.trim(), dtm, env.job_id.as_deref().unwrap_or(""));
            let run_dir = repo
                .working_dir()
                .join(&self.config.tracking_dir)
                .join(path_component(&run_name));
            let backend = self.backends.tracking(self.run_config(&project, &run_name, run_dir))?;
            return Ok(Deployment::Tracked(RunReporter::new(run_name, project, params, backend)?));
        }

        if env.debug {
            if opts.host.is_some() {
                warn!("debug run: ignoring the cluster host and logging locally");
            }
            return self.local_run(&repo, &project, DEBUG_RUN_ID, &dtm, params);
        }

        let Some(host) = opts.host.as_deref() else {
            let run_id = ask_run_id(self.prompt.as_mut(), env.testing_branch.as_deref(), false, false)?;
            info!(experiment_id = %run_id, "local run");
            return self.local_run(&repo, &project, &run_id, &dtm, params);
        };

        if opts.sweep_yaml.is_some() {
            return Err(BuddyError::NotImplemented("sweep submission".to_string()));
        }
        if opts.proc_num > 1 {
            return Err(BuddyError::NotImplemented(format!(
                "submitting {} copies of the same job",
                opts.proc_num
            )));
        }

        let run_id = ask_run_id(self.prompt.as_mut(), env.testing_branch.as_deref(), true, false)?;
        info!(experiment_id = %run_id, "cluster run");
        let submission = self.submit(&repo, host, &run_id, env, opts)?;
        Ok(Deployment::Submitted(submission))
    }

    /// Like [`deploy`](Self::deploy), but exits the process once a job is submitted.
    pub fn deploy_or_exit(
        &mut self,
        params: &HyperparameterSet,
        env: &Environment,
        opts: &DeployOptions,
    ) -> Result<Reporter> {
        match self.deploy(params, env, opts)? {
            Deployment::Tracked(reporter) => Ok(reporter),
            Deployment::Submitted(submission) => {
                info!(host = %submission.host, "job submitted, exiting");
                std::process::exit(0);
            }
        }
    }

    fn run_config(&self, project: &str, run_name: &str, run_dir: PathBuf) -> RunConfig {
        RunConfig::new(project, run_dir)
            .with_run_name(run_name)
            .with_flush_interval(self.config.flush_interval_rows, self.config.flush_interval_ms)
    }

    fn local_run(
        &self,
        repo: &GitRepo,
        project: &str,
        run_id: &str,
        dtm: &str,
        params: &HyperparameterSet,
    ) -> Result<Deployment> {
        let log_dir = repo
            .working_dir()
            .join(&self.config.log_dir)
            .join(path_component(run_id))
            .join(dtm);
        info!(dir = %log_dir.display(), "logging locally");
        let run_name = format!("{run_id}_{dtm}");
        let backend = self.backends.local(self.run_config(project, &run_name, log_dir))?;
        Ok(Deployment::Tracked(RunReporter::new(run_name, project, params, backend)?))
    }

    fn submit(
        &mut self,
        repo: &GitRepo,
        host: &str,
        run_id: &str,
        env: &Environment,
        opts: &DeployOptions,
    ) -> Result<Submission> {
        let commit = repo.snapshot(run_id)?;
        let mut headers = opts.extra_headers.clone();
        if let Some(partition) = remote::partition_header(run_id) {
            headers.push('\n');
            headers.push_str(partition);
        }

        let staging = std::env::temp_dir().join(format!("buddy-scripts-{}", uuid::Uuid::new_v4()));
        let scripts_dir = repo.working_dir().join(&self.config.scripts_dir);
        remote::stage_scripts(&scripts_dir, &staging, &headers)?;

        let job = JobSpec {
            repo_url: repo.remote_url()?,
            entrypoint: repo.relative_path(&env.entrypoint).to_string_lossy().to_string(),
            commit,
        };

        let mut shell = (self.connect)(host)?;
        let result = remote::submit(shell.as_mut(), &staging, &job, self.config.credentials.as_deref());
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            warn!(dir = %staging.display(), "failed to remove staged scripts: {}", e);
        }
        result
    }
}

/// Repository name from the remote URL, or the root folder name without a remote.
fn project_name(repo: &GitRepo) -> String {
    repo.project_name().unwrap_or_else(|e| {
        warn!("no remote to name the project after ({}), using the folder name", e);
        repo.working_dir()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("project")
            .to_string()
    })
}

fn path_component(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect()
}
