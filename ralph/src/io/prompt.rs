//! Instruction prompt handed to the agent at the start of each iteration.

use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use tracing::debug;

/// Built-in prompt used when the config does not override `agent.prompt`.
pub const DEFAULT_PROMPT: &str = include_str!("prompts/iteration.md");

/// Values available to the prompt template.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub stories_path: &'a Path,
    pub iteration: u32,
    pub story_id: Option<&'a str>,
}

/// Render `template` with the iteration inputs.
///
/// Templates may reference `stories_path`, `iteration` and `story_id` (absent
/// when no story is eligible).
pub fn render_prompt(template: &str, inputs: &PromptInputs<'_>) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("iteration", template)
        .context("parse prompt template")?;
    let rendered = env
        .get_template("iteration")?
        .render(context! {
            stories_path => inputs.stories_path.display().to_string(),
            iteration => inputs.iteration,
            story_id => inputs.story_id,
        })
        .context("render prompt template")?;
    let rendered = rendered.trim().to_string();
    debug!(iteration = inputs.iteration, len = rendered.len(), "rendered prompt");
    Ok(rendered)
}
