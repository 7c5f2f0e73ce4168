//! Backlog load/save helpers with schema validation, plus the status mark operations.
//!
//! `save` overwrites the file in place. A crash mid-write can leave a
//! truncated backlog behind; the agent edits the same file concurrently, so a
//! temp-file rename would not buy consistency anyway.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::backlog::{Backlog, Story, StoryStatus};

const BACKLOG_SCHEMA: &str = include_str!("../../schemas/backlog.schema.json");

static VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(BACKLOG_SCHEMA).expect("backlog schema is valid json");
    validator_for(&schema).expect("backlog schema compiles")
});

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("read backlog {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write backlog {}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse backlog {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("backlog {} failed schema validation: {}", .path.display(), .messages.join("; "))]
    Schema { path: PathBuf, messages: Vec<String> },
    #[error("serialize backlog")]
    Serialize(#[source] serde_json::Error),
    #[error("unknown story {0}")]
    UnknownStory(String),
}

impl StoreError {
    /// Malformed content, as opposed to an unreadable or unwritable file.
    pub fn is_parse_error(&self) -> bool {
        matches!(self, StoreError::Parse { .. } | StoreError::Schema { .. })
    }
}

/// Load and validate a backlog from disk.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load(path: &Path) -> Result<Backlog, StoreError> {
    let contents = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |source| StoreError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let value: Value = serde_json::from_str(&contents).map_err(parse_error)?;
    validate_schema(path, &value)?;
    let backlog: Backlog = serde_json::from_value(value).map_err(parse_error)?;
    debug!(stories = backlog.stories.len(), "loaded backlog");
    Ok(backlog)
}

/// Overwrite the backlog file with pretty-printed JSON.
pub fn save(path: &Path, backlog: &Backlog) -> Result<(), StoreError> {
    let mut buf = serde_json::to_string_pretty(backlog).map_err(StoreError::Serialize)?;
    buf.push('\n');
    fs::write(path, buf).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_schema(path: &Path, value: &Value) -> Result<(), StoreError> {
    if VALIDATOR.is_valid(value) {
        return Ok(());
    }
    let messages = VALIDATOR
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(StoreError::Schema {
        path: path.to_path_buf(),
        messages,
    })
}

fn story_mut<'a>(backlog: &'a mut Backlog, id: &str) -> Result<&'a mut Story, StoreError> {
    backlog
        .stories
        .iter_mut()
        .find(|story| story.id == id)
        .ok_or_else(|| StoreError::UnknownStory(id.to_string()))
}

/// Move a story to `in_progress`. A complete story stays complete.
pub fn mark_in_progress(backlog: &mut Backlog, id: &str) -> Result<(), StoreError> {
    let story = story_mut(backlog, id)?;
    if story.status == StoryStatus::Pending {
        story.status = StoryStatus::InProgress;
    }
    Ok(())
}

/// Mark a story complete with its commit.
///
/// Every step is marked done unconditionally; steps are not verified
/// individually.
pub fn mark_complete(backlog: &mut Backlog, id: &str, commit_hash: &str) -> Result<(), StoreError> {
    let story = story_mut(backlog, id)?;
    story.status = StoryStatus::Complete;
    story.commit_hash = Some(commit_hash.to_string());
    story.completed_at = Some(Utc::now().to_rfc3339());
    for step in &mut story.steps {
        step.done = true;
    }
    Ok(())
}

/// Load, apply a mark operation, and save back.
pub fn update(
    path: &Path,
    apply: impl FnOnce(&mut Backlog) -> Result<(), StoreError>,
) -> Result<Backlog, StoreError> {
    let mut backlog = load(path)?;
    apply(&mut backlog)?;
    save(path, &backlog)?;
    info!(path = %path.display(), "saved backlog");
    Ok(backlog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backlog_of, story, write_backlog};

    fn with_steps(mut story: Story) -> Story {
        story.steps = vec![
            crate::backlog::Step {
                description: "one".to_string(),
                done: false,
            },
            crate::backlog::Step {
                description: "two".to_string(),
                done: true,
            },
        ];
        story
    }

    #[test]
    fn save_then_load_preserves_backlog() {
        let temp = tempfile::tempdir().expect("tempdir");
        let backlog = backlog_of(vec![
            story("STORY-001", 1, StoryStatus::Pending),
            story("STORY-002", 2, StoryStatus::Complete),
        ]);
        let path = write_backlog(temp.path(), &backlog);
        assert_eq!(load(&path).expect("load"), backlog);
    }

    #[test]
    fn loads_documented_file_shape() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stories.json");
        fs::write(
            &path,
            r#"{
  "plan": {"name": "Auth", "source": "plan.md", "createdAt": "2026-01-01", "qualityGates": ["npm test"]},
  "stories": [
    {"id": "STORY-001", "title": "Login", "description": "d", "priority": 1, "status": "in_progress",
     "blockedBy": null, "files": [{"path": "src/a.ts", "action": "modify"}],
     "steps": [{"description": "s", "done": false}]}
  ]
}"#,
        )
        .expect("write");
        let backlog = load(&path).expect("load");
        assert_eq!(backlog.plan.quality_gates, vec!["npm test"]);
        assert_eq!(backlog.stories[0].status, StoryStatus::InProgress);
        assert_eq!(backlog.stories[0].files[0].action, "modify");
    }

    #[test]
    fn missing_file_is_read_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load(&temp.path().join("missing.json")).expect_err("missing");
        assert!(matches!(err, StoreError::Read { .. }));
        assert!(!err.is_parse_error());
    }

    #[test]
    fn invalid_json_is_parse_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stories.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load(&path).expect_err("invalid");
        assert!(matches!(err, StoreError::Parse { .. }));
    }

    #[test]
    fn structurally_wrong_document_fails_schema() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stories.json");
        fs::write(
            &path,
            r#"{"plan": {"name": "p"}, "stories": [{"id": "S", "title": "t", "priority": "high", "status": "done"}]}"#,
        )
        .expect("write");
        let err = load(&path).expect_err("schema");
        assert!(err.is_parse_error());
        assert!(err.to_string().contains("schema validation"));
    }

    #[test]
    fn mark_in_progress_never_reverts_complete() {
        let mut backlog = backlog_of(vec![
            story("A", 1, StoryStatus::Pending),
            story("B", 2, StoryStatus::Complete),
        ]);
        mark_in_progress(&mut backlog, "A").expect("mark A");
        mark_in_progress(&mut backlog, "B").expect("mark B");
        assert_eq!(backlog.stories[0].status, StoryStatus::InProgress);
        assert_eq!(backlog.stories[1].status, StoryStatus::Complete);
    }

    #[test]
    fn mark_complete_sets_commit_and_all_steps() {
        let mut backlog = backlog_of(vec![with_steps(story("A", 1, StoryStatus::InProgress))]);
        mark_complete(&mut backlog, "A", "abc123").expect("mark");
        let story = &backlog.stories[0];
        assert_eq!(story.status, StoryStatus::Complete);
        assert_eq!(story.commit_hash.as_deref(), Some("abc123"));
        assert!(story.completed_at.is_some());
        assert!(story.steps.iter().all(|step| step.done));
    }

    #[test]
    fn marking_unknown_story_fails() {
        let mut backlog = backlog_of(vec![story("A", 1, StoryStatus::Pending)]);
        let err = mark_complete(&mut backlog, "Z", "abc").expect_err("unknown");
        assert!(matches!(err, StoreError::UnknownStory(id) if id == "Z"));
    }

    #[test]
    fn update_persists_mark() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = write_backlog(
            temp.path(),
            &backlog_of(vec![story("A", 1, StoryStatus::Pending)]),
        );
        update(&path, |backlog| mark_in_progress(backlog, "A")).expect("update");
        assert_eq!(
            load(&path).expect("reload").stories[0].status,
            StoryStatus::InProgress
        );
    }
}
