//! Autonomous agent loop driver.
//!
//! Works through `thoughts/shared/ralph/stories.json` one story at a time by
//! invoking a coding agent, until the backlog is complete or the loop gives up.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use ralph::backlog::StoryStatus;
use ralph::core::controller::{Level, Notice};
use ralph::core::scheduler::{completed_count, is_blocked};
use ralph::core::types::OutputStream;
use ralph::exit_codes;
use ralph::io::agent::CommandAgent;
use ralph::io::backlog_store::{self, mark_complete, mark_in_progress};
use ralph::io::config::{default_config_path, load_config, project_dir_for};
use ralph::logging;
use ralph::select::{SelectOutcome, select_from_path};
use ralph::session::{Session, SessionHandle, SessionOptions};

const DEFAULT_STORIES_PATH: &str = "thoughts/shared/ralph/stories.json";

#[derive(Parser)]
#[command(
    name = "ralph",
    version,
    about = "Autonomous agent loop over a story backlog"
)]
struct Cli {
    /// Debug-level diagnostics on stderr (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent loop until the backlog is complete or the loop stops.
    Run(RunArgs),
    /// Print the id of the next eligible story.
    Next {
        #[arg(default_value = DEFAULT_STORIES_PATH)]
        stories: PathBuf,
    },
    /// Show plan progress and per-story status.
    Status {
        #[arg(default_value = DEFAULT_STORIES_PATH)]
        stories: PathBuf,
    },
    /// Mark a story as in progress.
    MarkInProgress {
        id: String,
        #[arg(default_value = DEFAULT_STORIES_PATH)]
        stories: PathBuf,
    },
    /// Mark a story complete with its commit hash (all steps are marked done).
    MarkComplete {
        id: String,
        #[arg(long)]
        commit: String,
        #[arg(default_value = DEFAULT_STORIES_PATH)]
        stories: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    #[arg(default_value = DEFAULT_STORIES_PATH)]
    stories: PathBuf,

    /// Config file (defaults to `ralph.toml` next to the backlog).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent working directory (defaults to the directory containing `thoughts/`).
    #[arg(long)]
    project_dir: Option<PathBuf>,

    #[arg(short = 'n', long)]
    max_iterations: Option<u32>,

    /// Seconds to pause between iterations.
    #[arg(short, long)]
    pause: Option<u64>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(args) => cmd_run(&args, cli.verbose),
        Command::Next { stories } => cmd_next(&stories),
        Command::Status { stories } => cmd_status(&stories),
        Command::MarkInProgress { id, stories } => {
            backlog_store::update(&stories, |backlog| mark_in_progress(backlog, &id))?;
            println!("{id}: in_progress");
            Ok(exit_codes::OK)
        }
        Command::MarkComplete { id, commit, stories } => {
            backlog_store::update(&stories, |backlog| mark_complete(backlog, &id, &commit))?;
            println!("{id}: complete ({commit})");
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(args: &RunArgs, verbose: bool) -> Result<i32> {
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&args.stories));
    let mut config = load_config(&config_path)?;
    if let Some(max_iterations) = args.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(pause) = args.pause {
        config.pause_secs = pause;
    }
    config.validate().context("invalid command-line overrides")?;

    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => project_dir_for(&args.stories)?,
    };
    let options = SessionOptions::from_config(&config, &args.stories, &project_dir);
    let session = Session::new(CommandAgent::from_config(&config), options)?;

    let summary = session.backlog();
    println!(
        "{}: {}/{} stories complete",
        summary.plan_name, summary.completed, summary.total
    );
    println!("Commands: p = pause/resume, c = continue, q = quit");
    spawn_command_reader(session.handle());

    let outcome = session.run(|notice| print_notice(notice, verbose))?;
    println!(
        "Finished {} after {} iteration(s) in {}s: {}/{} stories complete",
        outcome.state,
        outcome.iterations,
        outcome.elapsed.as_secs(),
        outcome.backlog.completed,
        outcome.backlog.total
    );
    if let Some(err) = &outcome.last_error {
        println!("Last error: {err}");
    }
    Ok(if outcome.is_complete() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

/// Forward single-letter commands from stdin until the session ends or stdin closes.
fn spawn_command_reader(handle: SessionHandle) {
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let delivered = match line.trim() {
                "p" => handle.pause_toggle(),
                "c" => handle.continue_now(),
                "q" => handle.stop(),
                "" => true,
                other => {
                    eprintln!("unknown command {other:?} (p, c, q)");
                    true
                }
            };
            if !delivered {
                break;
            }
        }
        debug!("command reader finished");
    });
}

fn print_notice(notice: &Notice, verbose: bool) {
    match notice {
        Notice::Log { level, message } => {
            let marker = match level {
                Level::Info => " ",
                Level::Success => "+",
                Level::Warning => "!",
                Level::Error => "x",
            };
            println!("[{marker}] {message}");
        }
        Notice::Activity { description, .. } => println!("    > {description}"),
        Notice::Output { stream, text } if verbose => {
            let tag = match stream {
                OutputStream::Stdout => "out",
                OutputStream::Stderr => "err",
            };
            println!("    {tag}| {text}");
        }
        Notice::Output { .. } => {}
        Notice::StoryStarted(story) => println!("==> {} - {}", story.id, story.title),
        Notice::Phase(phase) => println!("    phase: {phase}"),
        Notice::Progress { completed, total } => println!("    progress: {completed}/{total}"),
        Notice::StateChanged(state) => println!("    state: {state}"),
    }
}

fn cmd_next(stories: &Path) -> Result<i32> {
    match select_from_path(stories)? {
        SelectOutcome::Complete => {
            println!("all stories complete");
            Ok(exit_codes::COMPLETE)
        }
        SelectOutcome::Open(story) => {
            println!("{}", story.id);
            Ok(exit_codes::OK)
        }
        SelectOutcome::Blocked { remaining } => {
            println!("no eligible story: {remaining} remaining, all blocked");
            Ok(exit_codes::BLOCKED)
        }
    }
}

fn cmd_status(stories: &Path) -> Result<i32> {
    let backlog = backlog_store::load(stories)?;
    println!(
        "{}: {}/{} complete",
        backlog.plan.name,
        completed_count(&backlog),
        backlog.stories.len()
    );
    let mut ordered = backlog.stories.iter().collect::<Vec<_>>();
    ordered.sort_by_key(|story| story.priority);
    for story in ordered {
        let status = if story.status != StoryStatus::Complete && is_blocked(story, &backlog) {
            format!(
                "blocked by {}",
                story.blocked_by.as_deref().unwrap_or_default()
            )
        } else {
            story.status.to_string()
        };
        println!(
            "{:>4}  {:<12} {}  [{}]",
            story.priority, story.id, story.title, status
        );
    }
    Ok(exit_codes::OK)
}
