//! Values exchanged between the process runner and the iteration controller.
//!
//! Everything here is immutable once sent; readers and the runner never share
//! memory with the controller, they only pass these values over channels.

use std::time::Duration;

use thiserror::Error;

use crate::core::signals::{Signal, StoryAnnouncement};
use crate::core::watcher::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Why an agent run did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("failed to spawn agent: {0}")]
    Spawn(String),
    #[error("agent exited with status {}", describe_code(.code))]
    Exit { code: Option<i32> },
    #[error("agent timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("agent run cancelled")]
    Cancelled,
    #[error("agent i/o failed: {0}")]
    Io(String),
}

fn describe_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "unknown".to_string(), |code| code.to_string())
}

/// Final result of one agent run. Delivered exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFinish {
    /// `None` when the process was killed by a signal or never started.
    pub exit_code: Option<i32>,
    /// Every raw line from both streams, in arrival order.
    pub output: String,
    /// Decoded text of the run: text blocks of structured lines, raw text otherwise.
    pub transcript: String,
    pub duration: Duration,
    pub error: Option<RunError>,
}

impl RunFinish {
    /// A run that failed before producing any output.
    pub fn failed(error: RunError, duration: Duration) -> Self {
        Self {
            exit_code: None,
            output: String::new(),
            transcript: String::new(),
            duration,
            error: Some(error),
        }
    }
}

/// Event streamed from a running agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// Human-readable tool activity derived from a structured line.
    Activity {
        tool: Option<String>,
        description: String,
    },
    /// A raw output line, always emitted for logging.
    Line { stream: OutputStream, text: String },
    StoryAnnounced(StoryAnnouncement),
    PhaseChanged(Phase),
    /// The strongest control marker seen so far changed mid-run.
    SignalSeen(Signal),
    /// Last event of a run; the channel closes after it.
    Finished(RunFinish),
}
