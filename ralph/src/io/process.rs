//! Streaming agent process runner with timeout, cancellation and tree-kill.
//!
//! One runner thread owns the child. Two reader threads forward lines from
//! stdout and stderr over a bounded channel; the runner decodes them through a
//! [`StreamRouter`] and sends [`RunEvent`]s to the consumer over another
//! bounded channel, so a slow consumer eventually blocks the child's pipes
//! instead of dropping output. Line order is preserved within a stream, not
//! across the two streams.
//!
//! On Unix the child leads its own process group and cancellation kills the
//! whole group. On Windows `taskkill /T` walks the tree. Elsewhere only the
//! direct child is guaranteed to die.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::events::{decode_event, extract_activity};
use crate::core::types::{OutputStream, RunError, RunEvent, RunFinish};
use crate::core::watcher::{OutputWatcher, WatchEvent};

/// How often the runner re-checks cancellation and the deadline while idle.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to keep draining pipes after a kill before giving up on them.
const DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Shared cancellation flag observed by the runner's wait loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One agent invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub program: String,
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Capacity of the event channel handed to the consumer.
    pub event_buffer: usize,
}

/// Consumer side of a run: the event stream plus its cancel switch.
///
/// The stream ends with exactly one [`RunEvent::Finished`], after which the
/// channel is closed.
#[derive(Debug)]
pub struct RunHandle {
    events: Receiver<RunEvent>,
    cancel: CancelToken,
}

impl RunHandle {
    pub fn new(events: Receiver<RunEvent>, cancel: CancelToken) -> Self {
        Self { events, cancel }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn into_parts(self) -> (Receiver<RunEvent>, CancelToken) {
        (self.events, self.cancel)
    }

    /// Block until the run finishes, collecting every event in order.
    pub fn collect(self) -> Vec<RunEvent> {
        self.events.into_iter().collect()
    }
}

/// Spawn the agent on a runner thread and return its event stream.
///
/// Spawn failures are not returned here; they arrive as a `Finished` event
/// carrying [`RunError::Spawn`] so every launch ends the same way.
#[instrument(skip_all, fields(program = %request.program, timeout_secs = request.timeout.as_secs()))]
pub fn spawn_run(request: RunRequest) -> Result<RunHandle> {
    let (tx, rx) = mpsc::sync_channel(request.event_buffer.max(1));
    let cancel = CancelToken::new();
    let runner_cancel = cancel.clone();
    thread::Builder::new()
        .name("ralph-runner".to_string())
        .spawn(move || run_to_completion(&request, &runner_cancel, &tx))
        .context("spawn runner thread")?;
    Ok(RunHandle::new(rx, cancel))
}

fn run_to_completion(request: &RunRequest, cancel: &CancelToken, tx: &SyncSender<RunEvent>) {
    let started = Instant::now();
    let finish = match drive_child(request, cancel, tx, started) {
        Ok(finish) => finish,
        Err(err) => RunFinish::failed(err, started.elapsed()),
    };
    info!(
        exit_code = ?finish.exit_code,
        error = ?finish.error,
        elapsed_ms = finish.duration.as_millis() as u64,
        "agent run finished"
    );
    if tx.send(RunEvent::Finished(finish)).is_err() {
        debug!("run finished after consumer hung up");
    }
}

enum ReaderMessage {
    Line(OutputStream, String),
    Failed(OutputStream, String),
}

fn drive_child(
    request: &RunRequest,
    cancel: &CancelToken,
    tx: &SyncSender<RunEvent>,
    started: Instant,
) -> Result<RunFinish, RunError> {
    let mut cmd = Command::new(&request.program);
    cmd.args(&request.args)
        .current_dir(&request.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(workdir = %request.workdir.display(), "spawning agent process");
    let mut child = cmd.spawn().map_err(|err| {
        error!(err = %err, "failed to spawn agent");
        RunError::Spawn(format!("{}: {err}", request.program))
    })?;

    let (line_tx, line_rx) = mpsc::sync_channel(request.event_buffer.max(1));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, OutputStream::Stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, OutputStream::Stderr, line_tx));
    } else {
        drop(line_tx);
    }

    let deadline = started + request.timeout;
    let mut router = StreamRouter::new();
    let mut listener_gone = false;
    let mut killed: Option<RunError> = None;
    let mut killed_at: Option<Instant> = None;
    let mut io_error: Option<RunError> = None;
    let mut drained = true;

    loop {
        if killed.is_none() {
            killed = check_stop(&mut child, cancel, deadline, request.timeout);
            if killed.is_some() {
                killed_at = Some(Instant::now());
            }
        }
        // Orphaned descendants can keep the pipes open after a kill.
        if killed_at.is_some_and(|at| at.elapsed() >= DRAIN_GRACE) {
            warn!("output pipes still open after kill, abandoning readers");
            drained = false;
            break;
        }
        match line_rx.recv_timeout(POLL_INTERVAL) {
            Ok(ReaderMessage::Line(stream, text)) => {
                for event in router.route(stream, &text) {
                    if !listener_gone && tx.send(event).is_err() {
                        debug!("event consumer hung up, draining silently");
                        listener_gone = true;
                    }
                }
            }
            Ok(ReaderMessage::Failed(stream, message)) => {
                warn!(?stream, err = %message, "output reader failed");
                io_error.get_or_insert(RunError::Io(message));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if drained {
        for reader in readers {
            if reader.join().is_err() {
                io_error.get_or_insert(RunError::Io("output reader thread panicked".to_string()));
            }
        }
    }

    let status = wait_for_exit(&mut child, cancel, deadline, request.timeout, &mut killed)?;
    let (output, transcript) = router.finish();
    let error = killed.or(io_error).or_else(|| exit_error(status));
    Ok(RunFinish {
        exit_code: status.code(),
        output,
        transcript,
        duration: started.elapsed(),
        error,
    })
}

fn exit_error(status: ExitStatus) -> Option<RunError> {
    (!status.success()).then(|| RunError::Exit {
        code: status.code(),
    })
}

/// Kill the child if cancellation was requested or the deadline passed.
fn check_stop(
    child: &mut Child,
    cancel: &CancelToken,
    deadline: Instant,
    timeout: Duration,
) -> Option<RunError> {
    let reason = if cancel.is_cancelled() {
        info!("cancellation requested, killing agent");
        RunError::Cancelled
    } else if Instant::now() >= deadline {
        warn!(timeout_secs = timeout.as_secs(), "agent timed out, killing");
        RunError::TimedOut(timeout)
    } else {
        return None;
    };
    kill_process_tree(child);
    Some(reason)
}

fn wait_for_exit(
    child: &mut Child,
    cancel: &CancelToken,
    deadline: Instant,
    timeout: Duration,
    killed: &mut Option<RunError>,
) -> Result<ExitStatus, RunError> {
    loop {
        match child.wait_timeout(POLL_INTERVAL) {
            Ok(Some(status)) => return Ok(status),
            Ok(None) => {
                if killed.is_none() {
                    *killed = check_stop(child, cancel, deadline, timeout);
                }
            }
            Err(err) => {
                error!(err = %err, "failed waiting for agent");
                return Err(RunError::Io(format!("wait for agent: {err}")));
            }
        }
    }
}

/// Force-kill the child and, where supported, its descendants.
pub fn kill_process_tree(child: &mut Child) {
    let pid = child.id();

    #[cfg(unix)]
    {
        let group = format!("-{pid}");
        match Command::new("kill").args(["-KILL", "--", &group]).output() {
            Ok(out) if out.status.success() => debug!(pid, "killed process group"),
            Ok(out) => debug!(pid, status = ?out.status.code(), "process group kill failed"),
            Err(err) => warn!(pid, err = %err, "failed to run kill"),
        }
    }

    #[cfg(windows)]
    {
        match Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
        {
            Ok(out) => debug!(pid, status = ?out.status.code(), "taskkill finished"),
            Err(err) => warn!(pid, err = %err, "failed to run taskkill"),
        }
    }

    if let Err(err) = child.kill() {
        debug!(pid, err = %err, "direct kill failed (process likely exited)");
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    stream: OutputStream,
    tx: SyncSender<ReaderMessage>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let text = text.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(ReaderMessage::Line(stream, text)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = tx.send(ReaderMessage::Failed(stream, err.to_string()));
                    break;
                }
            }
        }
    })
}

/// Turns raw output lines into runner events and accumulates the run's text.
///
/// Structured lines contribute their decoded text to the transcript; lines
/// that fail to decode are kept verbatim. Every line is also reported as a
/// [`RunEvent::Line`].
#[derive(Debug, Default)]
pub struct StreamRouter {
    output: String,
    watcher: OutputWatcher,
}

impl StreamRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&mut self, stream: OutputStream, line: &str) -> Vec<RunEvent> {
        self.output.push_str(line);
        self.output.push('\n');

        let mut events = Vec::new();
        if line.trim().is_empty() {
            events.push(RunEvent::Line {
                stream,
                text: line.to_string(),
            });
            return events;
        }

        let observed = match decode_event(line) {
            Ok(event) => {
                if let Some(activity) = extract_activity(&event) {
                    events.push(RunEvent::Activity {
                        tool: activity.tool,
                        description: activity.description,
                    });
                }
                event.transcript_text()
            }
            Err(err) => {
                debug!(err = %err, "opaque output line");
                Some(line.to_string())
            }
        };
        events.push(RunEvent::Line {
            stream,
            text: line.to_string(),
        });

        if let Some(text) = observed {
            events.extend(self.watcher.observe(&text).into_iter().map(|event| match event {
                WatchEvent::StoryAnnounced(announcement) => RunEvent::StoryAnnounced(announcement),
                WatchEvent::PhaseChanged(phase) => RunEvent::PhaseChanged(phase),
                WatchEvent::SignalChanged(signal) => RunEvent::SignalSeen(signal),
            }));
        }
        events
    }

    /// Raw output and decoded transcript of everything routed so far.
    pub fn finish(self) -> (String, String) {
        (self.output, self.watcher.into_transcript())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::signals::Signal;

    #[test]
    fn router_decodes_structured_lines_and_keeps_raw_ones() {
        let mut router = StreamRouter::new();
        let events = router.route(
            OutputStream::Stdout,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Read","input":{"file_path":"src/lib.rs"}}]}}"#,
        );
        assert!(matches!(
            events.as_slice(),
            [RunEvent::Activity { description, .. }, RunEvent::Line { .. }] if description == "Reading: src/lib.rs"
        ));

        let events = router.route(OutputStream::Stderr, "plain <ralph-continue>next</ralph-continue>");
        assert!(events.contains(&RunEvent::SignalSeen(Signal::Continue {
            content: "next".to_string()
        })));

        let (output, transcript) = router.finish();
        assert_eq!(output.lines().count(), 2);
        assert!(transcript.contains("<ralph-continue>"));
        assert!(!transcript.contains("tool_use"));
    }

    #[test]
    fn router_reports_blank_lines() {
        let mut router = StreamRouter::new();
        let events = router.route(OutputStream::Stdout, "   ");
        assert_eq!(
            events,
            vec![RunEvent::Line {
                stream: OutputStream::Stdout,
                text: "   ".to_string(),
            }]
        );
        let (output, transcript) = router.finish();
        assert_eq!(output, "   \n");
        assert!(transcript.is_empty());
    }

    #[test]
    fn router_finds_markers_inside_json_text() {
        let mut router = StreamRouter::new();
        router.route(
            OutputStream::Stdout,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"done <promise>COMPLETE</promise>"}]}}"#,
        );
        let (_, transcript) = router.finish();
        assert!(transcript.contains("<promise>COMPLETE</promise>"));
    }

    #[cfg(unix)]
    fn request(script: &str, timeout: Duration) -> RunRequest {
        RunRequest {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            workdir: std::env::temp_dir(),
            timeout,
            event_buffer: 4,
        }
    }

    fn finish_of(events: &[RunEvent]) -> &RunFinish {
        let finishes = events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Finished(finish) => Some(finish),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(finishes.len(), 1, "exactly one finish");
        assert!(matches!(events.last(), Some(RunEvent::Finished(_))));
        finishes[0]
    }

    #[cfg(unix)]
    #[test]
    fn streams_both_outputs_then_finishes_once() {
        let handle = spawn_run(request(
            "echo one; echo two 1>&2; echo three",
            Duration::from_secs(10),
        ))
        .expect("spawn");
        let events = handle.collect();
        let stdout = events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Line {
                    stream: OutputStream::Stdout,
                    text,
                } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(stdout, vec!["one", "three"]);
        let finish = finish_of(&events);
        assert_eq!(finish.exit_code, Some(0));
        assert_eq!(finish.error, None);
        assert!(finish.output.contains("two"));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_an_execution_error() {
        let events = spawn_run(request("echo nope; exit 3", Duration::from_secs(10)))
            .expect("spawn")
            .collect();
        let finish = finish_of(&events);
        assert_eq!(finish.exit_code, Some(3));
        assert_eq!(finish.error, Some(RunError::Exit { code: Some(3) }));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_agent_and_its_children() {
        let started = Instant::now();
        let events = spawn_run(request(
            "sleep 30 & echo started; wait",
            Duration::from_millis(300),
        ))
        .expect("spawn")
        .collect();
        let finish = finish_of(&events);
        assert_eq!(
            finish.error,
            Some(RunError::TimedOut(Duration::from_millis(300)))
        );
        assert!(finish.output.contains("started"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_stops_a_running_agent() {
        let handle = spawn_run(request("echo ready; sleep 30", Duration::from_secs(60)))
            .expect("spawn");
        let (events, cancel) = handle.into_parts();
        let first = events.recv().expect("first event");
        assert!(matches!(first, RunEvent::Line { ref text, .. } if text == "ready"));
        cancel.cancel();
        let rest = events.into_iter().collect::<Vec<_>>();
        assert_eq!(finish_of(&rest).error, Some(RunError::Cancelled));
    }

    #[test]
    fn missing_program_finishes_with_spawn_error() {
        let events = spawn_run(RunRequest {
            program: "ralph-definitely-not-a-real-agent".to_string(),
            args: Vec::new(),
            workdir: std::env::temp_dir(),
            timeout: Duration::from_secs(5),
            event_buffer: 4,
        })
        .expect("spawn runner")
        .collect();
        assert!(matches!(
            finish_of(&events).error,
            Some(RunError::Spawn(_))
        ));
    }
}
