//! Repository-level configuration, read from `.buddy.yaml` at the repo root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::storage;

pub const CONFIG_FILE_NAME: &str = ".buddy.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuddyConfig {
    /// Script bundle synced to the cluster, relative to the repo root
    pub scripts_dir: PathBuf,
    /// Local log root, relative to the repo root
    pub log_dir: PathBuf,
    /// Root for runs tracked from a scheduler job, relative to the repo root
    pub tracking_dir: PathBuf,
    /// Environment variable holding the scheduler job id
    pub job_id_var: String,
    /// Tracking credentials copied to the cluster when missing there
    pub credentials: Option<PathBuf>,
    /// Flush metrics to disk every N rows
    pub flush_interval_rows: usize,
    /// Flush metrics to disk every N milliseconds
    pub flush_interval_ms: u64,
}

impl Default for BuddyConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("buddy_scripts"),
            log_dir: PathBuf::from("tensorboard"),
            tracking_dir: PathBuf::from("runs"),
            job_id_var: "SLURM_JOB_ID".to_string(),
            credentials: std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".netrc")),
            flush_interval_rows: 50,
            flush_interval_ms: 500,
        }
    }
}

impl BuddyConfig {
    /// Load `.buddy.yaml` from `repo_root`, falling back to defaults.
    pub fn load(repo_root: &Path) -> Result<Self> {
        let path = repo_root.join(CONFIG_FILE_NAME);
        if path.exists() {
            debug!(path = %path.display(), "loading config");
        }
        storage::load_yaml(&path)
    }

    pub fn with_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scripts_dir = dir.into();
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_credentials(mut self, path: Option<PathBuf>) -> Self {
        self.credentials = path;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = BuddyConfig::load(tmp.path()).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("tensorboard"));
        assert_eq!(config.job_id_var, "SLURM_JOB_ID");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE_NAME), "scripts_dir: slurm\nflush_interval_rows: 5\n").unwrap();
        let config = BuddyConfig::load(tmp.path()).unwrap();
        assert_eq!(config.scripts_dir, PathBuf::from("slurm"));
        assert_eq!(config.flush_interval_rows, 5);
        assert_eq!(config.flush_interval_ms, 500);
    }
}
