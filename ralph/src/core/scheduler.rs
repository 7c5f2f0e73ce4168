//! Deterministic story selection over a backlog.

use crate::backlog::{Backlog, Story};

/// Returns true iff `story` names a blocker that exists in `backlog` and is not complete.
///
/// A blocker id that is absent from the backlog does not block: dangling links
/// are tolerated rather than treated as permanent stalls.
pub fn is_blocked(story: &Story, backlog: &Backlog) -> bool {
    let Some(blocker_id) = story.blocked_by.as_deref() else {
        return false;
    };
    backlog
        .stories
        .iter()
        .find(|other| other.id == blocker_id)
        .is_some_and(|blocker| !blocker.is_complete())
}

/// Pick the most urgent eligible story (not complete, not blocked).
///
/// Ties on priority resolve to declaration order. `None` means "no candidate",
/// which is not the same as "all complete" (see [`all_complete`]).
pub fn next_story(backlog: &Backlog) -> Option<&Story> {
    let mut candidates: Vec<&Story> = backlog
        .stories
        .iter()
        .filter(|story| !story.is_complete() && !is_blocked(story, backlog))
        .collect();
    // `sort_by_key` is stable.
    candidates.sort_by_key(|story| story.priority);
    candidates.into_iter().next()
}

pub fn find_story<'a>(backlog: &'a Backlog, id: &str) -> Option<&'a Story> {
    backlog.stories.iter().find(|story| story.id == id)
}

pub fn completed_count(backlog: &Backlog) -> usize {
    backlog
        .stories
        .iter()
        .filter(|story| story.is_complete())
        .count()
}

pub fn remaining_count(backlog: &Backlog) -> usize {
    backlog.stories.len() - completed_count(backlog)
}

pub fn all_complete(backlog: &Backlog) -> bool {
    remaining_count(backlog) == 0
}

/// Identifier and title of a story, detached from the backlog it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryRef {
    pub id: String,
    pub title: String,
}

impl From<&Story> for StoryRef {
    fn from(story: &Story) -> Self {
        Self {
            id: story.id.clone(),
            title: story.title.clone(),
        }
    }
}

/// Point-in-time view of a backlog, as consumed by the iteration controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacklogSummary {
    pub plan_name: String,
    pub total: usize,
    pub completed: usize,
    /// Remaining stories whose blocker is still open.
    pub blocked: usize,
    pub next: Option<StoryRef>,
}

impl BacklogSummary {
    pub fn from_backlog(backlog: &Backlog) -> Self {
        let blocked = backlog
            .stories
            .iter()
            .filter(|story| !story.is_complete() && is_blocked(story, backlog))
            .count();
        Self {
            plan_name: backlog.plan.name.clone(),
            total: backlog.stories.len(),
            completed: completed_count(backlog),
            blocked,
            next: next_story(backlog).map(StoryRef::from),
        }
    }

    pub fn remaining(&self) -> usize {
        self.total - self.completed
    }

    pub fn all_complete(&self) -> bool {
        self.remaining() == 0
    }
}
