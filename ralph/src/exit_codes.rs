//! Stable exit codes for ralph CLI commands.

/// Command succeeded, a story was selected, or the run completed.
pub const OK: i32 = 0;
/// Invalid backlog/config, failed command, or a run that ended in error.
pub const INVALID: i32 = 1;
/// `ralph next` found every story complete.
pub const COMPLETE: i32 = 2;
/// `ralph next` found open stories, but all of them are blocked.
pub const BLOCKED: i32 = 3;
