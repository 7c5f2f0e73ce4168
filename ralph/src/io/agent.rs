//! Agent abstraction for iteration launches.
//!
//! The [`Agent`] trait decouples the session loop from the actual agent
//! backend (a command line, `claude` by default). Tests use scripted agents
//! that replay canned output without spawning processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::io::config::{AgentConfig, RalphConfig};
use crate::io::process::{RunHandle, RunRequest, spawn_run};
use crate::io::prompt::{PromptInputs, render_prompt};

/// Parameters for one iteration's agent run.
#[derive(Debug, Clone)]
pub struct IterationRequest {
    pub iteration: u32,
    /// Working directory for the agent process.
    pub project_dir: PathBuf,
    /// Backlog file the agent is told to work from.
    pub stories_path: PathBuf,
    /// Story the controller expects to be picked, if any is eligible.
    pub story_id: Option<String>,
}

/// Abstraction over agent backends.
pub trait Agent: Send {
    /// Start one run. The returned stream must end with exactly one `Finished` event.
    fn launch(&self, request: &IterationRequest) -> Result<RunHandle>;
}

/// Agent that spawns a configured command with the rendered prompt as its last argument.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    agent: AgentConfig,
    timeout: Duration,
    event_buffer: usize,
}

impl CommandAgent {
    pub fn from_config(config: &RalphConfig) -> Self {
        Self {
            agent: config.agent.clone(),
            timeout: config.iteration_timeout(),
            event_buffer: config.event_buffer,
        }
    }

    /// Build the process request without spawning it.
    pub fn run_request(&self, request: &IterationRequest) -> Result<RunRequest> {
        let prompt = render_prompt(
            &self.agent.prompt,
            &PromptInputs {
                stories_path: &request.stories_path,
                iteration: request.iteration,
                story_id: request.story_id.as_deref(),
            },
        )?;
        let (program, rest) = self
            .agent
            .command
            .split_first()
            .context("agent.command is empty")?;
        let mut args = rest.to_vec();
        args.push(prompt);
        Ok(RunRequest {
            program: program.clone(),
            args,
            workdir: request.project_dir.clone(),
            timeout: self.timeout,
            event_buffer: self.event_buffer,
        })
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(iteration = request.iteration))]
    fn launch(&self, request: &IterationRequest) -> Result<RunHandle> {
        let run = self.run_request(request)?;
        info!(
            program = %run.program,
            workdir = %run.workdir.display(),
            "launching agent"
        );
        spawn_run(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iteration(story_id: Option<&str>) -> IterationRequest {
        IterationRequest {
            iteration: 2,
            project_dir: PathBuf::from("/work"),
            stories_path: PathBuf::from("thoughts/shared/ralph/stories.json"),
            story_id: story_id.map(str::to_string),
        }
    }

    #[test]
    fn prompt_is_appended_after_configured_args() {
        let agent = CommandAgent::from_config(&RalphConfig::default());
        let run = agent.run_request(&iteration(None)).expect("request");
        assert_eq!(run.program, "claude");
        assert_eq!(
            run.args,
            vec![
                "--dangerously-skip-permissions".to_string(),
                "--print".to_string(),
                "Execute the next story from thoughts/shared/ralph/stories.json using the /prism-ralph workflow."
                    .to_string(),
            ]
        );
        assert_eq!(run.workdir, PathBuf::from("/work"));
        assert_eq!(run.timeout, Duration::from_secs(1800));
        assert_eq!(run.event_buffer, 100);
    }

    #[test]
    fn custom_command_and_template() {
        let mut config = RalphConfig::default();
        config.agent.command = vec!["my-agent".to_string()];
        config.agent.prompt = "work on {{ story_id }}".to_string();
        let run = CommandAgent::from_config(&config)
            .run_request(&iteration(Some("STORY-004")))
            .expect("request");
        assert_eq!(run.program, "my-agent");
        assert_eq!(run.args, vec!["work on STORY-004".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn launches_configured_command() {
        use crate::core::types::RunEvent;

        let mut config = RalphConfig::default();
        config.agent.command = vec!["sh".to_string(), "-c".to_string()];
        config.agent.prompt = "echo '<ralph-continue>ok</ralph-continue>'".to_string();
        let mut request = iteration(None);
        request.project_dir = std::env::temp_dir();
        let events = CommandAgent::from_config(&config)
            .launch(&request)
            .expect("launch")
            .collect();
        let Some(RunEvent::Finished(finish)) = events.last() else {
            panic!("missing finish");
        };
        assert_eq!(finish.error, None);
        assert!(finish.transcript.contains("<ralph-continue>ok</ralph-continue>"));
    }
}
