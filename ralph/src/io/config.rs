//! Loop configuration stored in `ralph.toml` next to the backlog file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::controller::ControllerConfig;

pub const CONFIG_FILE_NAME: &str = "ralph.toml";

/// Loop configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RalphConfig {
    /// Hard ceiling on iterations per session.
    pub max_iterations: u32,

    /// Consecutive failures (execution errors or retry signals) before giving up.
    pub max_consecutive_errors: u32,

    /// Pause between iterations after a non-failing one.
    pub pause_secs: u64,

    /// Linear backoff step after a failure.
    pub backoff_unit_secs: u64,

    /// Wall-clock limit for a single agent run.
    pub iteration_timeout_secs: u64,

    /// Capacity of the runner to controller event queue.
    pub event_buffer: usize,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Program and arguments. The rendered prompt is appended as the last argument.
    pub command: Vec<String>,

    /// Prompt template; `stories_path` is available.
    pub prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--dangerously-skip-permissions".to_string(),
                "--print".to_string(),
            ],
            prompt: crate::io::prompt::DEFAULT_PROMPT.to_string(),
        }
    }
}

impl Default for RalphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_consecutive_errors: 3,
            pause_secs: 2,
            backoff_unit_secs: 2,
            iteration_timeout_secs: 30 * 60,
            event_buffer: 100,
            agent: AgentConfig::default(),
        }
    }
}

impl RalphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(anyhow!("max_consecutive_errors must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.event_buffer == 0 {
            return Err(anyhow!("event_buffer must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.prompt.trim().is_empty() {
            return Err(anyhow!("agent.prompt must not be empty"));
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_iterations: self.max_iterations,
            max_consecutive_errors: self.max_consecutive_errors,
            pause: Duration::from_secs(self.pause_secs),
            backoff_unit: Duration::from_secs(self.backoff_unit_secs),
        }
    }
}

/// Default config location for a backlog file: `ralph.toml` in the same directory.
pub fn default_config_path(stories_path: &Path) -> PathBuf {
    stories_path
        .parent()
        .map_or_else(|| PathBuf::from(CONFIG_FILE_NAME), |dir| dir.join(CONFIG_FILE_NAME))
}

/// Project root for a backlog at `<project>/thoughts/shared/ralph/stories.json`.
///
/// Falls back to the current directory when the backlog lives elsewhere.
pub fn project_dir_for(stories_path: &Path) -> Result<PathBuf> {
    let absolute = std::path::absolute(stories_path)
        .with_context(|| format!("resolve {}", stories_path.display()))?;
    let mut ancestors = absolute.ancestors().skip(3);
    if let Some(thoughts) = ancestors.next()
        && thoughts.file_name().is_some_and(|name| name == "thoughts")
        && let Some(project) = ancestors.next()
    {
        return Ok(project.to_path_buf());
    }
    std::env::current_dir().context("read current directory")
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RalphConfig::default()`.
pub fn load_config(path: &Path) -> Result<RalphConfig> {
    if !path.exists() {
        let cfg = RalphConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RalphConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RalphConfig::default());
        assert_eq!(cfg.controller_config(), ControllerConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            "max_iterations = 7\n[agent]\ncommand = [\"my-agent\", \"--run\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 7);
        assert_eq!(cfg.agent.command, vec!["my-agent", "--run"]);
        assert_eq!(cfg.agent.prompt, AgentConfig::default().prompt);
        assert_eq!(cfg.pause_secs, 2);
    }

    #[test]
    fn rejects_empty_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[agent]\ncommand = []\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("agent.command"));
    }

    #[test]
    fn project_dir_is_the_directory_holding_thoughts() {
        let dir = project_dir_for(Path::new("/work/app/thoughts/shared/ralph/stories.json"))
            .expect("resolve");
        assert_eq!(dir, PathBuf::from("/work/app"));

        let fallback = project_dir_for(Path::new("/elsewhere/stories.json")).expect("resolve");
        assert_eq!(fallback, std::env::current_dir().expect("cwd"));
    }

    #[test]
    fn config_sits_next_to_backlog() {
        assert_eq!(
            default_config_path(Path::new("thoughts/shared/ralph/stories.json")),
            PathBuf::from("thoughts/shared/ralph/ralph.toml")
        );
    }
}
