//! Selection helpers for `ralph next` and `ralph status`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::backlog::Backlog;
use crate::core::scheduler::{StoryRef, all_complete, next_story, remaining_count};
use crate::io::backlog_store;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every story is complete.
    Complete,
    /// Next eligible story.
    Open(StoryRef),
    /// Stories remain but every one of them waits on an incomplete blocker.
    Blocked { remaining: usize },
}

/// Select the next story from an in-memory backlog.
pub fn select_story(backlog: &Backlog) -> SelectOutcome {
    if all_complete(backlog) {
        return SelectOutcome::Complete;
    }
    match next_story(backlog) {
        Some(story) => SelectOutcome::Open(StoryRef::from(story)),
        None => SelectOutcome::Blocked {
            remaining: remaining_count(backlog),
        },
    }
}

/// Load the backlog from disk and select the next story.
pub fn select_from_path(stories_path: &Path) -> Result<SelectOutcome> {
    let backlog = backlog_store::load(stories_path).context("load stories for selection")?;
    Ok(select_story(&backlog))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::StoryStatus;
    use crate::test_support::{backlog_of, blocked_story, story};

    #[test]
    fn complete_backlog_selects_nothing() {
        let backlog = backlog_of(vec![story("A", 1, StoryStatus::Complete)]);
        assert_eq!(select_story(&backlog), SelectOutcome::Complete);
    }

    #[test]
    fn empty_backlog_is_complete() {
        assert_eq!(select_story(&backlog_of(Vec::new())), SelectOutcome::Complete);
    }

    #[test]
    fn all_blocked_is_distinct_from_complete() {
        let backlog = backlog_of(vec![
            story("A", 1, StoryStatus::InProgress),
            blocked_story("B", 2, StoryStatus::Pending, "A"),
        ]);
        // A is in progress, so it is still a candidate.
        assert!(matches!(select_story(&backlog), SelectOutcome::Open(story) if story.id == "A"));

        let backlog = backlog_of(vec![
            blocked_story("A", 1, StoryStatus::Pending, "B"),
            blocked_story("B", 2, StoryStatus::Pending, "A"),
        ]);
        assert_eq!(
            select_story(&backlog),
            SelectOutcome::Blocked { remaining: 2 }
        );
    }
}
