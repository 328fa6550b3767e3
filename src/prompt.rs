//! Asking the user for a run id.

use dialoguer::Input;
use tracing::info;

use crate::error::Result;

/// Source of the human-chosen part of a run name.
pub trait RunIdPrompt {
    /// Ask for a run id. `None` or an empty answer means "no id".
    fn ask(&mut self, title: &str) -> Result<Option<String>>;
}

/// Asks on the terminal. Fails with an I/O error when not attached to one.
#[derive(Debug, Default)]
pub struct StdinPrompt;

impl RunIdPrompt for StdinPrompt {
    fn ask(&mut self, title: &str) -> Result<Option<String>> {
        info!("Name your run on the terminal");
        let answer: String = Input::new()
            .with_prompt(format!("Running on {title}, describe your experiment (experiment_id)"))
            .allow_empty(true)
            .interact_text()?;
        Ok(Some(answer))
    }
}

/// Always answers with the same id.
#[derive(Debug, Clone)]
pub struct FixedPrompt(pub Option<String>);

impl RunIdPrompt for FixedPrompt {
    fn ask(&mut self, _title: &str) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Title shown when asking: `[LOCAL]`, `[CLUSTER]`, `[LOCAL-SWEEP]` ...
pub fn prompt_title(cluster: bool, sweep: bool) -> String {
    let mut title = String::from(if cluster { "[CLUSTER" } else { "[LOCAL" });
    if sweep {
        title.push_str("-SWEEP");
    }
    title.push(']');
    title
}

/// Turn a raw answer into a run id.
pub fn normalize_run_id(answer: Option<&str>, cluster: bool) -> String {
    let id = match answer.map(str::trim) {
        Some(a) if !a.is_empty() => a.replace(' ', "_"),
        _ => "no_id".to_string(),
    };
    if cluster {
        format!("[CLUSTER] {id}")
    } else {
        id
    }
}

/// Run id used by automated test branches, unique per call.
pub fn testing_branch_run_id(branch: &str) -> String {
    format!("TESTING_BRANCH-{branch}-{}", uuid::Uuid::new_v4())
}

/// Ask for a run id, or derive it from the testing branch if one is set.
pub fn ask_run_id(
    prompt: &mut dyn RunIdPrompt,
    testing_branch: Option<&str>,
    cluster: bool,
    sweep: bool,
) -> Result<String> {
    let answer = match testing_branch {
        Some(branch) => Some(testing_branch_run_id(branch)),
        None => prompt.ask(&prompt_title(cluster, sweep))?,
    };
    Ok(normalize_run_id(answer.as_deref(), cluster))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles() {
        assert_eq!(prompt_title(false, false), "[LOCAL]");
        assert_eq!(prompt_title(true, false), "[CLUSTER]");
        assert_eq!(prompt_title(true, true), "[CLUSTER-SWEEP]");
    }

    #[test]
    fn normalization() {
        assert_eq!(normalize_run_id(Some("lr sweep v2"), false), "lr_sweep_v2");
        assert_eq!(normalize_run_id(Some(""), false), "no_id");
        assert_eq!(normalize_run_id(None, true), "[CLUSTER] no_id");
    }

    #[test]
    fn testing_branch_skips_prompt() {
        let mut prompt = FixedPrompt(Some("ignored".into()));
        let id = ask_run_id(&mut prompt, Some("ci"), false, false).unwrap();
        assert!(id.starts_with("TESTING_BRANCH-ci-"));
    }
}
