//! Embedded control markers in agent output.
//!
//! The agent communicates its verdict for an iteration by printing one of a
//! small set of tags. Detection always runs over the whole accumulated output
//! of a run, and the first kind in [`SIGNAL_PRIORITY`] that matches wins.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Kind of control marker, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    None,
    Complete,
    Continue,
    Retry,
    Blocked,
    Error,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::None => "NONE",
            SignalKind::Complete => "COMPLETE",
            SignalKind::Continue => "CONTINUE",
            SignalKind::Retry => "RETRY",
            SignalKind::Blocked => "BLOCKED",
            SignalKind::Error => "ERROR",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Match order for [`detect_signal`]. Earlier entries shadow later ones.
pub const SIGNAL_PRIORITY: [SignalKind; 5] = [
    SignalKind::Complete,
    SignalKind::Error,
    SignalKind::Retry,
    SignalKind::Blocked,
    SignalKind::Continue,
];

/// A decoded control marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    None,
    /// `<promise>COMPLETE</promise>`: the agent believes the backlog is done.
    Complete,
    Continue {
        content: String,
    },
    Retry {
        content: String,
        reason: Option<String>,
    },
    Blocked {
        content: String,
        reason: Option<String>,
    },
    Error {
        content: String,
        reason: Option<String>,
    },
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::None => SignalKind::None,
            Signal::Complete => SignalKind::Complete,
            Signal::Continue { .. } => SignalKind::Continue,
            Signal::Retry { .. } => SignalKind::Retry,
            Signal::Blocked { .. } => SignalKind::Blocked,
            Signal::Error { .. } => SignalKind::Error,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Signal::None | Signal::Complete => "",
            Signal::Continue { content }
            | Signal::Retry { content, .. }
            | Signal::Blocked { content, .. }
            | Signal::Error { content, .. } => content,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Signal::Retry { reason, .. }
            | Signal::Blocked { reason, .. }
            | Signal::Error { reason, .. } => reason.as_deref(),
            Signal::None | Signal::Complete | Signal::Continue { .. } => None,
        }
    }

    fn from_parts(kind: SignalKind, content: String, reason: Option<String>) -> Self {
        match kind {
            SignalKind::None => Signal::None,
            SignalKind::Complete => Signal::Complete,
            SignalKind::Continue => Signal::Continue { content },
            SignalKind::Retry => Signal::Retry { content, reason },
            SignalKind::Blocked => Signal::Blocked { content, reason },
            SignalKind::Error => Signal::Error { content, reason },
        }
    }
}

fn marker_pattern(kind: SignalKind) -> Option<&'static str> {
    match kind {
        SignalKind::Complete => Some(r"<promise>COMPLETE</promise>"),
        SignalKind::Continue => Some(r"(?s)<ralph-continue>(.*?)</ralph-continue>"),
        SignalKind::Retry => Some(r"(?s)<ralph-retry[^>]*>(.*?)</ralph-retry>"),
        SignalKind::Blocked => Some(r"(?s)<ralph-blocked[^>]*>(.*?)</ralph-blocked>"),
        SignalKind::Error => Some(r"(?s)<ralph-error[^>]*>(.*?)</ralph-error>"),
        SignalKind::None => None,
    }
}

static MATCHERS: LazyLock<Vec<(SignalKind, Regex)>> = LazyLock::new(|| {
    SIGNAL_PRIORITY
        .iter()
        .filter_map(|&kind| {
            let pattern = marker_pattern(kind)?;
            let re = Regex::new(pattern).expect("signal pattern should be valid");
            Some((kind, re))
        })
        .collect()
});

static REASON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"reason="([^"]*)""#).expect("reason pattern should be valid"));

/// Scan `text` for the highest-priority control marker.
pub fn detect_signal(text: &str) -> Signal {
    for (kind, re) in MATCHERS.iter() {
        let Some(caps) = re.captures(text) else {
            continue;
        };
        let content = caps
            .get(1)
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();
        let reason = caps
            .get(0)
            .and_then(|span| REASON_RE.captures(span.as_str()))
            .and_then(|reason| reason.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|reason| !reason.is_empty());
        return Signal::from_parts(*kind, content, reason);
    }
    Signal::None
}

/// A `<ralph-story>` block announcing which story the agent picked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryAnnouncement {
    pub id: String,
    pub title: String,
    pub priority: Option<u32>,
    pub files: Vec<String>,
}

static STORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<ralph-story>(.*?)</ralph-story>").expect("story pattern should be valid")
});
static STORY_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ID:\s*(\S+)").expect("id pattern should be valid"));
static STORY_TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Title:\s*(.+)").expect("title pattern should be valid"));
static STORY_PRIORITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Priority:\s*(\d+)").expect("priority pattern should be valid"));
static STORY_FILES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Files:\s*\n((?:\s*-\s*.+\n?)+)").expect("files pattern should be valid")
});

/// Extract the first story announcement in `text`.
///
/// Returns `None` when there is no block or the block has no `ID:` field.
/// Pure and idempotent; callers compare ids to suppress repeats.
pub fn detect_story_announcement(text: &str) -> Option<StoryAnnouncement> {
    let body = STORY_RE.captures(text)?.get(1)?.as_str();
    let id = STORY_ID_RE.captures(body)?.get(1)?.as_str().to_string();

    let title = STORY_TITLE_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    let priority = STORY_PRIORITY_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let files = STORY_FILES_RE
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|list| {
            list.as_str()
                .lines()
                .filter_map(|line| line.trim().strip_prefix('-'))
                .map(str::trim)
                .filter(|file| !file.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Some(StoryAnnouncement {
        id,
        title,
        priority,
        files,
    })
}

static STORY_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"STORY-\d+").expect("story ref pattern should be valid"));

/// Find a `STORY-<n>` identifier in free text, e.g. continue-marker content.
pub fn extract_story_id(text: &str) -> Option<&str> {
    STORY_REF_RE.find(text).map(|m| m.as_str())
}
