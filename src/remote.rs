//! Remote job submission over ssh.
//!
//! The protocol is a fixed shell script invoked with three positional
//! parameters: repository URL, entry point and commit hash.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{BuddyError, Result};
use crate::storage;

/// Script run on the remote host for a single experiment.
pub const RUN_SCRIPT: &str = "run_experiment.sh";
/// Scripts that carry `#SBATCH` headers and accept extra ones.
pub const HEADER_SCRIPTS: &[&str] = &["run_sweep.sh", "srun_python.sh", RUN_SCRIPT];

/// A host we can run commands on and copy files to.
pub trait RemoteShell {
    fn host(&self) -> &str;

    /// Run `command` remotely and return its trimmed stdout.
    fn run(&mut self, command: &str) -> Result<String>;

    /// Copy a local file or directory (recursively) into `remote_dir`.
    fn put(&mut self, local: &Path, remote_dir: &str) -> Result<()>;
}

/// `ssh` / `rsync` against a host configured in the user's ssh config.
#[derive(Debug, Clone)]
pub struct SshRemote {
    host: String,
    connect_timeout_secs: u32,
}

impl SshRemote {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            connect_timeout_secs: 10,
        }
    }

    pub fn with_connect_timeout(mut self, secs: u32) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Check that the host is reachable without interactive input.
    pub fn open(host: impl Into<String>) -> Result<Self> {
        let mut remote = Self::new(host);
        remote.run("true").map_err(|e| {
            BuddyError::Configuration(format!(
                "SSH connection failed ({e}). Make sure you can successfully run `ssh {}` \
                 with no parameters; any parameters should be set in the ssh_config file",
                remote.host
            ))
        })?;
        Ok(remote)
    }
}

fn run_process(mut cmd: Command, label: String) -> Result<String> {
    debug!(command = %label, "running");
    let output = cmd.output()?;
    if !output.status.success() {
        return Err(BuddyError::Command {
            program: label,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

impl RemoteShell for SshRemote {
    fn host(&self) -> &str {
        &self.host
    }

    fn run(&mut self, command: &str) -> Result<String> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs))
            .arg("-A")
            .arg(&self.host)
            .arg(command);
        run_process(cmd, format!("ssh {} {}", self.host, command))
    }

    fn put(&mut self, local: &Path, remote_dir: &str) -> Result<()> {
        let mut source = local.as_os_str().to_os_string();
        if local.is_dir() {
            // trailing slash: copy the contents, not the directory itself
            source.push("/");
        }
        let mut cmd = Command::new("rsync");
        cmd.arg("-rv")
            .arg(&source)
            .arg(format!("{}:{}", self.host, remote_dir));
        let out = run_process(cmd, format!("rsync -rv {} {}:{}", local.display(), self.host, remote_dir))?;
        log_cmd("rsync", &out);
        Ok(())
    }
}

fn log_cmd(cmd: &str, output: &str) {
    debug!("################################################################");
    debug!("## {}", cmd);
    debug!("################################################################");
    for line in output.lines() {
        debug!("{}", line);
    }
}

/// `#SBATCH` header lines implied by a run id suffix: `!!` and `!`.
pub fn partition_header(run_id: &str) -> Option<&'static str> {
    if run_id.ends_with("!!") {
        Some("#SBATCH --partition=unkillable")
    } else if run_id.ends_with('!') {
        Some("#SBATCH --partition=main")
    } else {
        None
    }
}

/// Insert `header` right after the last `#SBATCH` line of `script`.
///
/// Scripts without any `#SBATCH` line are returned unchanged.
pub fn insert_extra_header(script: &str, header: &str) -> String {
    let lines: Vec<&str> = script.lines().collect();
    let Some(last) = lines.iter().rposition(|l| l.contains("#SBATCH")) else {
        return script.to_string();
    };
    let mut out: Vec<&str> = Vec::with_capacity(lines.len() + 1);
    out.extend_from_slice(&lines[..=last]);
    out.push(header.trim_matches('\n'));
    out.extend_from_slice(&lines[last + 1..]);
    let mut joined = out.join("\n");
    if script.ends_with('\n') {
        joined.push('\n');
    }
    joined
}

/// Copy the script bundle into `staging`, inserting `extra_headers` into the
/// scripts that take them.
pub fn stage_scripts(scripts_dir: &Path, staging: &Path, extra_headers: &str) -> Result<PathBuf> {
    if !scripts_dir.is_dir() {
        return Err(BuddyError::Configuration(format!(
            "scripts directory not found: {}",
            scripts_dir.display()
        )));
    }
    storage::ensure_dir(staging)?;
    for entry in fs::read_dir(scripts_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let dest = staging.join(&name);
        let takes_header = name
            .to_str()
            .map(|n| HEADER_SCRIPTS.contains(&n))
            .unwrap_or(false);
        if takes_header && !extra_headers.trim().is_empty() {
            let script = fs::read_to_string(entry.path())?;
            fs::write(&dest, insert_extra_header(&script, extra_headers))?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(staging.to_path_buf())
}

/// What the remote scheduler was asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub repo_url: String,
    pub entrypoint: String,
    pub commit: String,
}

impl JobSpec {
    pub fn command(&self, scripts_folder: &str) -> String {
        format!(
            "bash -l {}/{} {} {} {}",
            scripts_folder.trim_end_matches('/'),
            RUN_SCRIPT,
            self.repo_url,
            self.entrypoint,
            self.commit
        )
    }
}

/// Receipt of a dispatched job.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub host: String,
    pub scripts_folder: String,
    pub command: String,
    pub output: String,
}

/// Sync the staged scripts and start the job.
pub fn submit(
    remote: &mut dyn RemoteShell,
    staged_scripts: &Path,
    job: &JobSpec,
    credentials: Option<&Path>,
) -> Result<Submission> {
    let scripts_folder = remote.run("mktemp -d -t experiment_buddy-XXXXXXXXXX")?;
    if scripts_folder.is_empty() {
        return Err(BuddyError::Other("remote mktemp returned no path".to_string()));
    }
    remote.put(staged_scripts, &format!("{scripts_folder}/"))?;

    if let Some(netrc) = credentials {
        ensure_credentials(remote, netrc)?;
    }

    let command = job.command(&scripts_folder);
    info!(host = remote.host(), command = %command, "submitting job");
    let output = remote.run(&command)?;
    Ok(Submission {
        host: remote.host().to_string(),
        scripts_folder,
        command,
        output,
    })
}

/// Copy the local tracking credentials if the remote has none.
pub fn ensure_credentials(remote: &mut dyn RemoteShell, local_netrc: &Path) -> Result<()> {
    if remote.run("test -f $HOME/.netrc").is_ok() {
        return Ok(());
    }
    if !local_netrc.exists() {
        warn!(path = %local_netrc.display(), "no local credentials to copy");
        return Ok(());
    }
    info!(
        "API key not found on {}. Copying it from {}",
        remote.host(),
        local_netrc.display()
    );
    remote.put(local_netrc, ".netrc")
}
