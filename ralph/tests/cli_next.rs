//! CLI tests for `ralph next`, `ralph status` and the mark commands.
//!
//! Spawns the ralph binary and verifies exit codes and backlog edits.

use std::process::Command;

use ralph::backlog::StoryStatus;
use ralph::exit_codes;
use ralph::test_support::{TestProject, backlog_of, blocked_story, story};

fn ralph(project: &TestProject, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_ralph"))
        .current_dir(project.root())
        .args(args)
        .output()
        .expect("run ralph")
}

#[test]
fn next_prints_lowest_priority_eligible_story() {
    let project = TestProject::new(&backlog_of(vec![
        story("A", 1, StoryStatus::Complete),
        blocked_story("B", 2, StoryStatus::Pending, "A"),
        blocked_story("C", 3, StoryStatus::Pending, "B"),
        story("D", 10, StoryStatus::Pending),
    ]));

    let output = ralph(&project, &["next"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "B");
}

#[test]
fn next_on_complete_backlog_exits_with_complete_code() {
    let project = TestProject::new(&backlog_of(vec![story("A", 1, StoryStatus::Complete)]));
    let output = ralph(&project, &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::COMPLETE));
}

#[test]
fn next_with_everything_blocked_exits_with_blocked_code() {
    let project = TestProject::new(&backlog_of(vec![
        blocked_story("A", 1, StoryStatus::Pending, "B"),
        blocked_story("B", 2, StoryStatus::Pending, "A"),
    ]));
    let output = ralph(&project, &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
}

#[test]
fn next_on_invalid_backlog_exits_with_invalid_code() {
    let project = TestProject::new(&backlog_of(Vec::new()));
    std::fs::write(project.stories_path(), "[]").expect("corrupt");
    let output = ralph(&project, &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("schema validation"));
}

#[test]
fn mark_commands_update_backlog_on_disk() {
    let project = TestProject::new(&backlog_of(vec![story("A", 1, StoryStatus::Pending)]));

    let output = ralph(&project, &["mark-in-progress", "A"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(project.load().stories[0].status, StoryStatus::InProgress);

    let output = ralph(&project, &["mark-complete", "A", "--commit", "abc123"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let story = &project.load().stories[0];
    assert_eq!(story.status, StoryStatus::Complete);
    assert_eq!(story.commit_hash.as_deref(), Some("abc123"));

    let output = ralph(&project, &["mark-complete", "missing", "--commit", "abc"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn status_lists_blocked_stories() {
    let project = TestProject::new(&backlog_of(vec![
        story("A", 1, StoryStatus::Pending),
        blocked_story("B", 2, StoryStatus::Pending, "A"),
    ]));
    let output = ralph(&project, &["status"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("0/2 complete"));
    assert!(stdout.contains("blocked by A"));
}

#[cfg(unix)]
#[test]
fn run_drives_configured_agent_to_completion() {
    let project = TestProject::new(&backlog_of(vec![story("STORY-001", 1, StoryStatus::Pending)]));
    // The agent completes the story itself, then reports completion.
    project.write_config(
        r#"pause_secs = 0
max_iterations = 2

[agent]
command = ["sh", "-c"]
prompt = "ralph mark-complete STORY-001 --commit deadbeef {{ stories_path }} >/dev/null && echo '<promise>COMPLETE</promise>'"
"#,
    );
    let bin_dir = std::path::Path::new(env!("CARGO_BIN_EXE_ralph"))
        .parent()
        .expect("bin dir")
        .to_path_buf();
    let path = format!(
        "{}:{}",
        bin_dir.display(),
        std::env::var("PATH").unwrap_or_default()
    );

    let output = Command::new(env!("CARGO_BIN_EXE_ralph"))
        .current_dir(project.root())
        .env("PATH", path)
        .args(["run", "--project-dir", "."])
        .stdin(std::process::Stdio::null())
        .output()
        .expect("run ralph");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(exit_codes::OK), "{stdout}");
    assert!(stdout.contains("All stories complete!"));
    assert_eq!(project.load().stories[0].commit_hash.as_deref(), Some("deadbeef"));
}

#[cfg(unix)]
#[test]
fn run_prints_notices_on_stdout_only() {
    let project = TestProject::new(&backlog_of(vec![story("STORY-001", 1, StoryStatus::Pending)]));
    project.write_config(
        r#"pause_secs = 0

[agent]
command = ["sh", "-c"]
prompt = "echo '<ralph-error>disk is on fire</ralph-error>'"
"#,
    );

    let output = Command::new(env!("CARGO_BIN_EXE_ralph"))
        .current_dir(project.root())
        .env_remove("RUST_LOG")
        .args(["run", "--project-dir", "."])
        .stdin(std::process::Stdio::null())
        .output()
        .expect("run ralph");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(stdout.contains("[x] disk is on fire"), "{stdout}");
    assert!(!stderr.contains("disk is on fire"), "{stderr}");
}
