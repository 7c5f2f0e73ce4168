//! Backlog file model (`stories.json`).
//!
//! One document per project: plan metadata plus the story list. Declared list
//! order carries no scheduling meaning; only `priority` and `blockedBy` do.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Backlog {
    pub plan: Plan,
    pub stories: Vec<Story>,
}

/// Immutable plan metadata attached to a backlog.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub created_at: String,
    /// Named external checks (lint, test, ...) the agent must pass.
    #[serde(default)]
    pub quality_gates: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Lower is more urgent.
    pub priority: i64,
    pub status: StoryStatus,
    /// Identifier of the single story that must complete first.
    #[serde(default)]
    pub blocked_by: Option<String>,
    #[serde(default)]
    pub files: Vec<TargetFile>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
}

impl Story {
    pub fn is_complete(&self) -> bool {
        self.status == StoryStatus::Complete
    }
}

/// Story lifecycle. Only ever advances `pending -> in_progress -> complete`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Pending,
    InProgress,
    Complete,
}

impl StoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Pending => "pending",
            StoryStatus::InProgress => "in_progress",
            StoryStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file the story expects to create, modify or delete.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetFile {
    pub path: String,
    #[serde(default)]
    pub action: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub description: String,
    #[serde(default)]
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_wire_format() {
        let raw = r#"{
          "plan": {"name": "auth", "source": "plan.md", "createdAt": "2025-01-01", "qualityGates": ["npm test"]},
          "stories": [{
            "id": "STORY-001",
            "title": "Login",
            "description": "Add login",
            "priority": 1,
            "status": "in_progress",
            "blockedBy": null,
            "files": [{"path": "src/login.ts", "action": "create"}],
            "steps": [{"description": "write form", "done": false}]
          }]
        }"#;
        let backlog: Backlog = serde_json::from_str(raw).expect("parse");
        assert_eq!(backlog.plan.quality_gates, vec!["npm test"]);
        let story = &backlog.stories[0];
        assert_eq!(story.status, StoryStatus::InProgress);
        assert_eq!(story.files[0].path, "src/login.ts");
        assert!(story.completed_at.is_none());
    }

    #[test]
    fn serializes_blocked_by_as_null_and_omits_empty_completion() {
        let story = Story {
            id: "S".to_string(),
            title: "T".to_string(),
            description: String::new(),
            priority: 1,
            status: StoryStatus::Pending,
            blocked_by: None,
            files: Vec::new(),
            steps: Vec::new(),
            completed_at: None,
            commit_hash: None,
        };
        let value = serde_json::to_value(&story).expect("serialize");
        assert!(value.get("blockedBy").expect("blockedBy key").is_null());
        assert!(value.get("commitHash").is_none());
        assert!(value.get("completedAt").is_none());
    }
}
