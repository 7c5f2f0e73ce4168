//! Session loop: executes the controller's effects.
//!
//! The loop owns the [`Controller`] and is the only place its state changes.
//! All blocking work happens elsewhere and reports back as a [`Message`] on
//! one bounded queue:
//!
//! - a pump thread forwards the active run's events,
//! - a loader thread answers each backlog reload,
//! - a one-shot timer thread delivers each scheduled wake-up,
//! - [`SessionHandle`] lets the presentation layer send user commands.
//!
//! At most one run is in flight; the controller only asks for a launch once
//! the previous run's `Finished` event has been handled.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::controller::{
    Controller, ControllerConfig, Effect, Message, Notice, RunState, Wake,
};
use crate::core::scheduler::BacklogSummary;
use crate::core::types::{RunError, RunEvent, RunFinish};
use crate::io::agent::{Agent, IterationRequest};
use crate::io::backlog_store;
use crate::io::config::RalphConfig;
use crate::io::process::CancelToken;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub stories_path: PathBuf,
    pub project_dir: PathBuf,
    pub controller: ControllerConfig,
    /// Capacity of the controller's message queue.
    pub queue_capacity: usize,
}

impl SessionOptions {
    pub fn from_config(config: &RalphConfig, stories_path: &Path, project_dir: &Path) -> Self {
        Self {
            stories_path: stories_path.to_path_buf(),
            project_dir: project_dir.to_path_buf(),
            controller: config.controller_config(),
            queue_capacity: config.event_buffer,
        }
    }
}

/// Sends user commands into a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: SyncSender<Message>,
}

impl SessionHandle {
    pub fn pause_toggle(&self) -> bool {
        self.send(Message::PauseToggle)
    }

    /// Start the next iteration now (e.g. after resuming from pause).
    pub fn continue_now(&self) -> bool {
        self.send(Message::Continue)
    }

    pub fn stop(&self) -> bool {
        self.send(Message::Stop)
    }

    /// Returns false once the session has ended.
    fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub state: RunState,
    pub iterations: u32,
    pub last_error: Option<String>,
    pub elapsed: Duration,
    pub backlog: BacklogSummary,
}

impl SessionOutcome {
    pub fn is_complete(&self) -> bool {
        self.state == RunState::Complete
    }
}

pub struct Session<A: Agent> {
    agent: A,
    controller: Controller,
    stories_path: PathBuf,
    project_dir: PathBuf,
    tx: SyncSender<Message>,
    rx: Receiver<Message>,
    local: VecDeque<Message>,
    active_run: Option<CancelToken>,
}

impl<A: Agent> Session<A> {
    /// Load the backlog and prepare a session. A backlog that cannot be loaded here is fatal.
    pub fn new(agent: A, options: SessionOptions) -> Result<Self> {
        let backlog = backlog_store::load(&options.stories_path)
            .with_context(|| format!("load stories {}", options.stories_path.display()))?;
        let summary = BacklogSummary::from_backlog(&backlog);
        info!(
            plan = %summary.plan_name,
            total = summary.total,
            completed = summary.completed,
            "loaded backlog"
        );
        let (tx, rx) = mpsc::sync_channel(options.queue_capacity.max(1));
        Ok(Self {
            agent,
            controller: Controller::new(options.controller, summary),
            stories_path: options.stories_path,
            project_dir: options.project_dir,
            tx,
            rx,
            local: VecDeque::new(),
            active_run: None,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn backlog(&self) -> &BacklogSummary {
        self.controller.backlog()
    }

    /// Run until the controller reaches a terminal state with no run in flight.
    ///
    /// `notify` receives every product notice in order.
    #[instrument(skip_all, fields(stories = %self.stories_path.display()))]
    pub fn run(mut self, mut notify: impl FnMut(&Notice)) -> Result<SessionOutcome> {
        self.local.push_back(Message::Start);
        loop {
            let message = match self.local.pop_front() {
                Some(message) => message,
                None => self
                    .rx
                    .recv()
                    .context("session queue closed unexpectedly")?,
            };
            if matches!(message, Message::Run(RunEvent::Finished(_))) {
                self.active_run = None;
            }
            for effect in self.controller.handle(message) {
                self.execute(effect, &mut notify);
            }
            if self.controller.is_finished() {
                break;
            }
        }

        let outcome = SessionOutcome {
            state: self.controller.state(),
            iterations: self.controller.iteration(),
            last_error: self.controller.last_error().map(str::to_string),
            elapsed: self.controller.elapsed(),
            backlog: self.controller.backlog().clone(),
        };
        info!(
            state = %outcome.state,
            iterations = outcome.iterations,
            elapsed_secs = outcome.elapsed.as_secs(),
            "session finished"
        );
        Ok(outcome)
    }

    fn execute(&mut self, effect: Effect, notify: &mut impl FnMut(&Notice)) {
        match effect {
            Effect::Launch { iteration } => self.launch(iteration),
            Effect::ReloadBacklog => self.reload_backlog(),
            Effect::Schedule {
                delay,
                ticket,
                wake,
            } => self.schedule(delay, ticket, wake),
            Effect::CancelRun => match &self.active_run {
                Some(cancel) => cancel.cancel(),
                None => debug!("cancel requested with no active run"),
            },
            Effect::Notify(notice) => notify(&notice),
        }
    }

    fn launch(&mut self, iteration: u32) {
        let request = IterationRequest {
            iteration,
            project_dir: self.project_dir.clone(),
            stories_path: self.stories_path.clone(),
            story_id: self
                .controller
                .current_story()
                .map(|story| story.id.clone()),
        };
        let handle = match self.agent.launch(&request) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(iteration, err = %format!("{err:#}"), "agent launch failed");
                let finish = RunFinish::failed(RunError::Spawn(format!("{err:#}")), Duration::ZERO);
                self.local
                    .push_back(Message::Run(RunEvent::Finished(finish)));
                return;
            }
        };

        let (events, cancel) = handle.into_parts();
        self.active_run = Some(cancel);
        let tx = self.tx.clone();
        let pump = thread::Builder::new()
            .name(format!("ralph-pump-{iteration}"))
            .spawn(move || {
                for event in events {
                    if tx.send(Message::Run(event)).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = pump {
            warn!(iteration, err = %err, "failed to start event pump");
            if let Some(cancel) = self.active_run.take() {
                cancel.cancel();
            }
            let finish = RunFinish::failed(RunError::Io(err.to_string()), Duration::ZERO);
            self.local
                .push_back(Message::Run(RunEvent::Finished(finish)));
        }
    }

    fn reload_backlog(&mut self) {
        let tx = self.tx.clone();
        let path = self.stories_path.clone();
        let load = move || {
            let result = backlog_store::load(&path)
                .map(|backlog| BacklogSummary::from_backlog(&backlog))
                .map_err(|err| format!("{:#}", anyhow::Error::from(err)));
            let _ = tx.send(Message::BacklogReloaded(result));
        };
        if let Err(err) = thread::Builder::new()
            .name("ralph-reload".to_string())
            .spawn(load)
        {
            self.local.push_back(Message::BacklogReloaded(Err(format!(
                "start reload thread: {err}"
            ))));
        }
    }

    fn schedule(&mut self, delay: Duration, ticket: u64, wake: Wake) {
        debug!(?delay, ticket, ?wake, "scheduling wake-up");
        let tx = self.tx.clone();
        let timer = move || {
            thread::sleep(delay);
            let _ = tx.send(Message::Timer { ticket, wake });
        };
        if let Err(err) = thread::Builder::new()
            .name("ralph-timer".to_string())
            .spawn(timer)
        {
            warn!(err = %err, "failed to start timer, waking immediately");
            self.local.push_back(Message::Timer { ticket, wake });
        }
    }
}
