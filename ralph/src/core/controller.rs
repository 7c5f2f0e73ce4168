//! Iteration state machine.
//!
//! The controller owns all mutable run state and reacts to one [`Message`] at a
//! time, returning the [`Effect`]s the caller must perform (launch an agent
//! run, reload the backlog, schedule a wake-up, notify the presentation
//! layer). It never blocks and performs no I/O itself, so every transition is
//! testable by feeding messages and inspecting effects.
//!
//! Policy summary:
//!
//! - A run that finishes without an execution error resets the
//!   consecutive-error counter, then the backlog is reloaded and only then is
//!   the run's control signal acted upon.
//! - Execution errors and `Retry` signals increment the counter and back off
//!   linearly (`count * backoff_unit`); reaching the ceiling is fatal.
//! - `Continue`, `Blocked` and "no signal" all continue after the fixed pause.
//! - `Complete` only completes when the reloaded backlog has nothing left.
//! - A wake-up that fires while paused is dropped, not replayed on resume;
//!   [`Message::Continue`] restarts the loop manually.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::scheduler::{BacklogSummary, StoryRef};
use crate::core::signals::{Signal, detect_signal, extract_story_id};
use crate::core::types::{OutputStream, RunEvent, RunFinish};
use crate::core::watcher::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Complete,
    Error,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Running => "RUNNING",
            RunState::Paused => "PAUSED",
            RunState::Complete => "COMPLETE",
            RunState::Error => "ERROR",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub max_iterations: u32,
    pub max_consecutive_errors: u32,
    /// Fixed delay before the next iteration after a non-failing one.
    pub pause: Duration,
    /// Backoff step; the n-th consecutive failure waits `n * backoff_unit`.
    pub backoff_unit: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_consecutive_errors: 3,
            pause: Duration::from_secs(2),
            backoff_unit: Duration::from_secs(2),
        }
    }
}

/// What a scheduled wake-up should do when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Start a new iteration (increments the iteration counter).
    NextIteration,
    /// Re-run the current iteration after an execution error.
    RetryIteration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Start,
    PauseToggle,
    /// User request to start the next iteration now.
    Continue,
    /// User request to cancel the current run and stop.
    Stop,
    BacklogReloaded(Result<BacklogSummary, String>),
    Run(RunEvent),
    Timer { ticket: u64, wake: Wake },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

/// Product output for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Log { level: Level, message: String },
    Activity {
        tool: Option<String>,
        description: String,
    },
    Output { stream: OutputStream, text: String },
    StoryStarted(StoryRef),
    Phase(Phase),
    Progress { completed: usize, total: usize },
    StateChanged(RunState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start exactly one agent run. Its events come back as [`Message::Run`].
    Launch { iteration: u32 },
    /// Reload the backlog from disk; answer with [`Message::BacklogReloaded`].
    ReloadBacklog,
    /// Deliver [`Message::Timer`] with this ticket after `delay`.
    Schedule { delay: Duration, ticket: u64, wake: Wake },
    /// Cancel the in-flight run. Its finish still arrives.
    CancelRun,
    Notify(Notice),
}

#[derive(Debug)]
pub struct Controller {
    config: ControllerConfig,
    state: RunState,
    iteration: u32,
    consecutive_errors: u32,
    current_story: Option<StoryRef>,
    backlog: BacklogSummary,
    started_at: Option<Instant>,
    in_flight: bool,
    pending_signal: Option<Signal>,
    ticket: u64,
    last_error: Option<String>,
}

impl Controller {
    pub fn new(config: ControllerConfig, backlog: BacklogSummary) -> Self {
        Self {
            config,
            state: RunState::Idle,
            iteration: 0,
            consecutive_errors: 0,
            current_story: None,
            backlog,
            started_at: None,
            in_flight: false,
            pending_signal: None,
            ticket: 0,
            last_error: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn current_story(&self) -> Option<&StoryRef> {
        self.current_story.as_ref()
    }

    pub fn backlog(&self) -> &BacklogSummary {
        &self.backlog
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    /// Terminal and with no run left to drain.
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() && !self.in_flight
    }

    pub fn handle(&mut self, message: Message) -> Vec<Effect> {
        let mut out = Vec::new();
        match message {
            Message::Start => self.on_start(&mut out),
            Message::PauseToggle => self.on_pause_toggle(&mut out),
            Message::Continue => self.on_continue(&mut out),
            Message::Stop => self.on_stop(&mut out),
            Message::BacklogReloaded(result) => self.on_backlog_reloaded(result, &mut out),
            Message::Run(event) => self.on_run_event(event, &mut out),
            Message::Timer { ticket, wake } => self.on_timer(ticket, wake, &mut out),
        }
        out
    }

    fn on_start(&mut self, out: &mut Vec<Effect>) {
        if self.state != RunState::Idle {
            debug!(state = %self.state, "start ignored");
            return;
        }
        self.iteration = 0;
        self.consecutive_errors = 0;
        self.started_at = Some(Instant::now());
        self.set_state(RunState::Running, out);
        log(out, Level::Info, "Starting Ralph execution...");
        self.begin_iteration(Wake::NextIteration, out);
    }

    fn on_pause_toggle(&mut self, out: &mut Vec<Effect>) {
        match self.state {
            RunState::Running => {
                self.set_state(RunState::Paused, out);
                log(out, Level::Warning, "Pausing after current story...");
            }
            RunState::Paused => {
                self.set_state(RunState::Running, out);
                log(out, Level::Info, "Resuming execution...");
            }
            _ => debug!(state = %self.state, "pause toggle ignored"),
        }
    }

    fn on_continue(&mut self, out: &mut Vec<Effect>) {
        match self.state {
            RunState::Running if self.in_flight || self.pending_signal.is_some() => {
                log(out, Level::Info, "Iteration already running");
            }
            RunState::Running => {
                // Supersede any pending wake-up so it cannot start a second iteration.
                self.ticket += 1;
                self.begin_iteration(Wake::NextIteration, out);
            }
            RunState::Paused => {
                log(out, Level::Info, "Execution paused, resume before continuing");
            }
            _ => debug!(state = %self.state, "continue ignored"),
        }
    }

    fn on_stop(&mut self, out: &mut Vec<Effect>) {
        if self.state.is_terminal() {
            return;
        }
        self.ticket += 1;
        self.pending_signal = None;
        log(out, Level::Warning, "Shutting down...");
        if self.in_flight {
            out.push(Effect::CancelRun);
        }
        self.fail("Stopped by user".to_string(), out);
    }

    fn on_timer(&mut self, ticket: u64, wake: Wake, out: &mut Vec<Effect>) {
        if ticket != self.ticket {
            debug!(ticket, current = self.ticket, "stale wake-up ignored");
            return;
        }
        self.begin_iteration(wake, out);
    }

    fn on_run_event(&mut self, event: RunEvent, out: &mut Vec<Effect>) {
        match event {
            RunEvent::Activity { tool, description } => {
                out.push(Effect::Notify(Notice::Activity { tool, description }));
            }
            RunEvent::Line { stream, text } => {
                out.push(Effect::Notify(Notice::Output { stream, text }));
            }
            RunEvent::StoryAnnounced(announcement) => {
                if self.current_story.as_ref().map(|story| story.id.as_str())
                    == Some(announcement.id.as_str())
                {
                    return;
                }
                let story = StoryRef {
                    id: announcement.id,
                    title: announcement.title,
                };
                log(
                    out,
                    Level::Info,
                    format!("Starting story: {} - {}", story.id, story.title),
                );
                out.push(Effect::Notify(Notice::StoryStarted(story.clone())));
                self.current_story = Some(story);
            }
            RunEvent::PhaseChanged(phase) => {
                out.push(Effect::Notify(Notice::Phase(phase)));
            }
            RunEvent::SignalSeen(signal) => {
                debug!(kind = %signal.kind(), "signal seen mid-run");
            }
            RunEvent::Finished(finish) => self.on_finished(finish, out),
        }
    }

    fn on_finished(&mut self, finish: RunFinish, out: &mut Vec<Effect>) {
        if !self.in_flight {
            warn!("run finish received with no run in flight");
        }
        self.in_flight = false;
        log(
            out,
            Level::Info,
            format!(
                "Iteration {} completed in {}s",
                self.iteration,
                finish.duration.as_secs()
            ),
        );

        if self.state.is_terminal() {
            return;
        }

        if let Some(err) = finish.error {
            self.consecutive_errors += 1;
            log(out, Level::Error, format!("Agent error: {err}"));
            if self.consecutive_errors >= self.config.max_consecutive_errors {
                self.fail("Too many consecutive errors".to_string(), out);
                return;
            }
            let delay = self.backoff_delay();
            log(
                out,
                Level::Warning,
                format!("Retrying in {}s...", delay.as_secs()),
            );
            self.schedule(delay, Wake::RetryIteration, out);
            return;
        }

        self.consecutive_errors = 0;
        let text = if finish.transcript.is_empty() {
            &finish.output
        } else {
            &finish.transcript
        };
        self.pending_signal = Some(detect_signal(text));
        out.push(Effect::ReloadBacklog);
    }

    fn on_backlog_reloaded(&mut self, result: Result<BacklogSummary, String>, out: &mut Vec<Effect>) {
        match result {
            Ok(summary) => {
                out.push(Effect::Notify(Notice::Progress {
                    completed: summary.completed,
                    total: summary.total,
                }));
                self.backlog = summary;
            }
            Err(message) => {
                log(
                    out,
                    Level::Warning,
                    format!("Failed to reload stories: {message}"),
                );
            }
        }
        if let Some(signal) = self.pending_signal.take() {
            self.act_on_signal(signal, out);
        }
    }

    fn act_on_signal(&mut self, signal: Signal, out: &mut Vec<Effect>) {
        if self.state.is_terminal() {
            return;
        }
        info!(kind = %signal.kind(), iteration = self.iteration, "acting on signal");
        match signal {
            Signal::Complete => {
                let remaining = self.backlog.remaining();
                if remaining == 0 {
                    self.complete(out);
                    return;
                }
                log(
                    out,
                    Level::Warning,
                    format!(
                        "COMPLETE signal received but {remaining} stories remain - ignoring and continuing"
                    ),
                );
                self.schedule(self.config.pause, Wake::NextIteration, out);
            }
            Signal::Continue { content } => {
                match extract_story_id(&content) {
                    Some(id) => log(out, Level::Success, format!("Story complete: {id}")),
                    None => log(out, Level::Info, "Story complete, continuing..."),
                }
                self.schedule(self.config.pause, Wake::NextIteration, out);
            }
            Signal::Blocked { content, reason } => {
                log(
                    out,
                    Level::Warning,
                    format!("Story blocked: {}", with_reason(&content, reason.as_deref())),
                );
                self.schedule(self.config.pause, Wake::NextIteration, out);
            }
            Signal::Retry { content, reason } => {
                self.consecutive_errors += 1;
                log(
                    out,
                    Level::Warning,
                    format!(
                        "Retry requested: {}",
                        with_reason(&content, reason.as_deref())
                    ),
                );
                if self.consecutive_errors >= self.config.max_consecutive_errors {
                    self.fail("Too many retries".to_string(), out);
                    return;
                }
                self.schedule(self.backoff_delay(), Wake::NextIteration, out);
            }
            Signal::Error { content, reason } => {
                let message = if content.is_empty() {
                    reason.unwrap_or_else(|| "Agent reported a fatal error".to_string())
                } else {
                    content
                };
                self.fail(message, out);
            }
            Signal::None => {
                log(out, Level::Info, "No signal detected, continuing...");
                self.schedule(self.config.pause, Wake::NextIteration, out);
            }
        }
    }

    fn begin_iteration(&mut self, wake: Wake, out: &mut Vec<Effect>) {
        match self.state {
            RunState::Running => {}
            RunState::Paused => {
                let message = match wake {
                    Wake::NextIteration => "Execution paused, press 'p' to resume...",
                    Wake::RetryIteration => "Retry deferred, execution paused...",
                };
                log(out, Level::Info, message);
                return;
            }
            _ => return,
        }
        if self.in_flight {
            warn!(iteration = self.iteration, "iteration already in flight");
            return;
        }

        match wake {
            Wake::NextIteration => {
                if self.backlog.all_complete() {
                    self.complete(out);
                    return;
                }
                if self.iteration >= self.config.max_iterations {
                    self.fail(
                        format!("Reached max iterations ({})", self.config.max_iterations),
                        out,
                    );
                    return;
                }
                self.iteration += 1;
                log(
                    out,
                    Level::Info,
                    format!(
                        "Starting iteration {}/{}",
                        self.iteration, self.config.max_iterations
                    ),
                );
            }
            Wake::RetryIteration => {
                log(
                    out,
                    Level::Info,
                    format!("Retrying iteration {}", self.iteration),
                );
            }
        }

        self.current_story = self.backlog.next.clone();
        match &self.current_story {
            Some(story) => out.push(Effect::Notify(Notice::StoryStarted(story.clone()))),
            None => log(
                out,
                Level::Warning,
                format!(
                    "No eligible story: all {} remaining stories are blocked",
                    self.backlog.remaining()
                ),
            ),
        }
        self.in_flight = true;
        out.push(Effect::Launch {
            iteration: self.iteration,
        });
    }

    fn backoff_delay(&self) -> Duration {
        self.config.backoff_unit * self.consecutive_errors
    }

    fn schedule(&mut self, delay: Duration, wake: Wake, out: &mut Vec<Effect>) {
        self.ticket += 1;
        out.push(Effect::Schedule {
            delay,
            ticket: self.ticket,
            wake,
        });
    }

    fn complete(&mut self, out: &mut Vec<Effect>) {
        self.current_story = None;
        self.set_state(RunState::Complete, out);
        log(out, Level::Success, "All stories complete!");
    }

    fn fail(&mut self, message: String, out: &mut Vec<Effect>) {
        log(out, Level::Error, message.clone());
        self.last_error = Some(message);
        self.set_state(RunState::Error, out);
    }

    fn set_state(&mut self, state: RunState, out: &mut Vec<Effect>) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "state transition");
        self.state = state;
        out.push(Effect::Notify(Notice::StateChanged(state)));
    }
}

fn with_reason(content: &str, reason: Option<&str>) -> String {
    match reason {
        Some(reason) => format!("{content} ({reason})"),
        None => content.to_string(),
    }
}

/// Queue a log notice, mirrored to tracing at debug level.
fn log(out: &mut Vec<Effect>, level: Level, message: impl Into<String>) {
    let message = message.into();
    debug!(?level, "{message}");
    out.push(Effect::Notify(Notice::Log { level, message }));
}
