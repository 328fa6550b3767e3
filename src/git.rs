//! Thin wrapper over the `git` executable.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::{BuddyError, Result};

/// A git working tree.
#[derive(Debug, Clone)]
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    /// Find the working tree containing `start`.
    pub fn discover(start: &Path) -> Result<Self> {
        let output = Command::new("git")
            .arg("-C")
            .arg(start)
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .map_err(|e| BuddyError::Configuration(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            return Err(BuddyError::Configuration(format!(
                "Could not find a git repo above {}",
                start.display()
            )));
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(root = %root, "found git repo");
        Ok(Self { root: PathBuf::from(root) })
    }

    pub fn working_dir(&self) -> &Path {
        &self.root
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()?;
        if !output.status.success() {
            return Err(BuddyError::Command {
                program: format!("git {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// URL of the first configured remote.
    pub fn remote_url(&self) -> Result<String> {
        let first = self.first_remote()?;
        self.git(&["remote", "get-url", &first])
    }

    fn first_remote(&self) -> Result<String> {
        self.git(&["remote"])?
            .lines()
            .next()
            .map(str::to_string)
            .ok_or_else(|| BuddyError::Configuration("the repository has no remote".to_string()))
    }

    pub fn current_branch(&self) -> Result<String> {
        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if branch == "HEAD" {
            return Err(BuddyError::Configuration(
                "cannot snapshot a detached HEAD, check out a branch first".to_string(),
            ));
        }
        Ok(branch)
    }

    /// Make the working tree, uncommitted changes included, reachable from the remote.
    ///
    /// Local changes are committed on a detached HEAD, tagged
    /// `snapshot/<branch>/<hash>` and only the tag is pushed. The branch is
    /// checked out again afterwards with the changes still in the working
    /// tree. A clean tree pushes the branch instead. Returns the commit to run.
    pub fn snapshot(&self, run_id: &str) -> Result<String> {
        let branch = self.current_branch()?;
        let remote = self.first_remote()?;
        self.git(&["checkout", "--detach"])?;
        let snapshot = self.commit_snapshot(run_id, &branch, &remote);
        let restored = self.git(&["checkout", &branch]);
        let hash = snapshot?;
        restored?;
        Ok(hash)
    }

    fn commit_snapshot(&self, run_id: &str, branch: &str, remote: &str) -> Result<String> {
        self.git(&["add", "."])?;
        if self.git(&["status", "--porcelain"])?.is_empty() {
            let hash = self.head_hash()?;
            debug!(%branch, %hash, "nothing to snapshot, pushing the branch");
            self.git(&["push", remote, branch])?;
            return Ok(hash);
        }

        self.git(&["commit", "--no-verify", "-q", "-m", run_id])?;
        let hash = self.head_hash()?;
        let tag = format!("snapshot/{branch}/{hash}");
        self.git(&["tag", &tag])?;
        // back to the branch tip with the changes unstaged
        self.git(&["reset", "-q", "HEAD~1"])?;
        info!(%tag, "pushing snapshot");
        self.git(&["push", remote, &tag])?;
        Ok(hash)
    }

    pub fn head_hash(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    pub fn head_message(&self) -> Result<String> {
        self.git(&["log", "-1", "--format=%B"])
    }

    /// Project name: the repository name in the remote URL.
    pub fn project_name(&self) -> Result<String> {
        Ok(project_name_from_url(&self.remote_url()?))
    }

    /// `path` relative to the working tree root, or unchanged if outside it.
    pub fn relative_path(&self, path: &Path) -> PathBuf {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };
        absolute
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or(absolute)
    }
}

pub fn project_name_from_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let without_suffix = trimmed.split(".git").next().unwrap_or(trimmed);
    without_suffix
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(without_suffix)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_name_from_common_urls() {
        assert_eq!(project_name_from_url("https://github.com/org/my-exp.git"), "my-exp");
        assert_eq!(project_name_from_url("git@github.com:org/my-exp.git"), "my-exp");
        assert_eq!(project_name_from_url("git@host:solo.git"), "solo");
        assert_eq!(project_name_from_url("https://github.com/org/plain/"), "plain");
    }

    #[test]
    fn discover_outside_repo_is_configuration_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = GitRepo::discover(tmp.path()).unwrap_err();
        assert!(matches!(err, BuddyError::Configuration(_)));
    }
}
