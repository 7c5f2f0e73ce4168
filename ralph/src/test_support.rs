//! Test-only helpers: backlog builders, temp projects and a scripted agent.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::backlog::{Backlog, Plan, Story, StoryStatus};
use crate::core::types::{OutputStream, RunError, RunEvent, RunFinish};
use crate::io::agent::{Agent, IterationRequest};
use crate::io::backlog_store;
use crate::io::process::{CancelToken, RunHandle, StreamRouter};

/// Relative location of the backlog inside a project.
pub const STORIES_RELATIVE_PATH: &str = "thoughts/shared/ralph/stories.json";

/// Create a deterministic story with default fields and no blocker.
pub fn story(id: &str, priority: i64, status: StoryStatus) -> Story {
    Story {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        priority,
        status,
        blocked_by: None,
        files: Vec::new(),
        steps: Vec::new(),
        completed_at: None,
        commit_hash: None,
    }
}

/// Create a story blocked by `blocker`.
pub fn blocked_story(id: &str, priority: i64, status: StoryStatus, blocker: &str) -> Story {
    Story {
        blocked_by: Some(blocker.to_string()),
        ..story(id, priority, status)
    }
}

pub fn backlog_of(stories: Vec<Story>) -> Backlog {
    Backlog {
        plan: Plan {
            name: "Test plan".to_string(),
            source: "plan.md".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            quality_gates: vec!["cargo test".to_string()],
        },
        stories,
    }
}

/// Write `backlog` as `stories.json` under `dir` and return its path.
pub fn write_backlog(dir: &Path, backlog: &Backlog) -> PathBuf {
    let path = dir.join("stories.json");
    backlog_store::save(&path, backlog).expect("write backlog");
    path
}

/// A temporary project directory laid out like a real one.
pub struct TestProject {
    dir: TempDir,
}

impl TestProject {
    pub fn new(backlog: &Backlog) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(STORIES_RELATIVE_PATH);
        fs::create_dir_all(path.parent().expect("stories parent")).expect("create dirs");
        backlog_store::save(&path, backlog).expect("write backlog");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn stories_path(&self) -> PathBuf {
        self.dir.path().join(STORIES_RELATIVE_PATH)
    }

    pub fn load(&self) -> Backlog {
        backlog_store::load(&self.stories_path()).expect("load backlog")
    }

    /// Write `ralph.toml` next to the backlog.
    pub fn write_config(&self, contents: &str) {
        let path = self
            .stories_path()
            .with_file_name(crate::io::config::CONFIG_FILE_NAME);
        fs::write(path, contents).expect("write config");
    }
}

/// Canned behavior for one scripted run.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    lines: Vec<(OutputStream, String)>,
    error: Option<RunError>,
    backlog_update: Option<Backlog>,
    hang: bool,
}

impl ScriptedRun {
    /// A successful run printing `lines` on stdout.
    pub fn output(lines: &[&str]) -> Self {
        Self {
            lines: lines
                .iter()
                .map(|line| (OutputStream::Stdout, (*line).to_string()))
                .collect(),
            error: None,
            backlog_update: None,
            hang: false,
        }
    }

    /// A run that fails with `error` after printing nothing.
    pub fn failing(error: RunError) -> Self {
        Self {
            error: Some(error),
            ..Self::output(&[])
        }
    }

    /// A run that prints `lines` and then blocks until cancelled.
    pub fn hanging(lines: &[&str]) -> Self {
        Self {
            hang: true,
            ..Self::output(lines)
        }
    }

    /// Rewrite the backlog file before the run finishes, as the agent would.
    pub fn updating(mut self, backlog: Backlog) -> Self {
        self.backlog_update = Some(backlog);
        self
    }
}

/// Agent that replays scripted runs in order and records every request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAgent {
    runs: Arc<Mutex<VecDeque<ScriptedRun>>>,
    requests: Arc<Mutex<Vec<IterationRequest>>>,
}

impl ScriptedAgent {
    pub fn new(runs: Vec<ScriptedRun>) -> Self {
        Self {
            runs: Arc::new(Mutex::new(runs.into())),
            requests: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<IterationRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Agent for ScriptedAgent {
    fn launch(&self, request: &IterationRequest) -> Result<RunHandle> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let run = self
            .runs
            .lock()
            .expect("runs lock")
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted run left for iteration {}", request.iteration))?;

        let (tx, rx) = mpsc::sync_channel(8);
        let cancel = CancelToken::new();
        let observed = cancel.clone();
        let stories_path = request.stories_path.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let mut router = StreamRouter::new();
            for (stream, line) in &run.lines {
                for event in router.route(*stream, line) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            if let Some(backlog) = &run.backlog_update {
                backlog_store::save(&stories_path, backlog).expect("scripted backlog update");
            }
            let mut error = run.error.clone();
            if run.hang {
                while !observed.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                error = Some(RunError::Cancelled);
            }
            let (output, transcript) = router.finish();
            let finish = RunFinish {
                exit_code: if error.is_none() { Some(0) } else { None },
                output,
                transcript,
                duration: started.elapsed(),
                error,
            };
            let _ = tx.send(RunEvent::Finished(finish));
        });
        Ok(RunHandle::new(rx, cancel))
    }
}
