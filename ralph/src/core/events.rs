//! Structured agent output: one JSON record per line.
//!
//! Lines are decoded into [`StreamEvent`], a closed set of event kinds. Lines
//! that are not well-formed records yield [`DecodeError`] and callers treat
//! them as opaque text.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// One line of agent output that could not be decoded as a stream event.
#[derive(Debug, Error)]
#[error("malformed stream event: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// A tool invocation descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse(ToolUse),
    /// Any block kind this runner does not interpret (`thinking`, `tool_result`, ...).
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// An assistant message carrying text and/or tool-use blocks.
    Assistant { content: Vec<ContentBlock> },
    /// A standalone tool invocation record.
    ToolUse { tool: ToolUse },
    /// The outcome of a tool invocation.
    ToolResult { tool_use_id: Option<String> },
    /// The agent's final record for the session.
    Result {
        subtype: Option<String>,
        text: String,
        is_error: bool,
        duration_ms: Option<u64>,
    },
    /// Any other record kind (`system`, `user`, ...).
    Other {
        kind: String,
        subtype: Option<String>,
    },
}

impl StreamEvent {
    /// Text this event contributes to the human-readable transcript of a run.
    pub fn transcript_text(&self) -> Option<String> {
        match self {
            StreamEvent::Assistant { content } => {
                let texts: Vec<&str> = content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text(text) => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                (!texts.is_empty()).then(|| texts.join("\n"))
            }
            StreamEvent::Result { text, .. } if !text.is_empty() => Some(text.clone()),
            _ => None,
        }
    }
}

// Wire shapes. Every field is optional except `type`; the typed enums above are
// built from these.

#[derive(Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    tool: Option<RawTool>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    duration_ms: Option<u64>,
}

#[derive(Deserialize)]
struct RawTool {
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Vec<RawBlock>,
}

#[derive(Deserialize)]
struct RawBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Value,
}

impl From<RawBlock> for ContentBlock {
    fn from(raw: RawBlock) -> Self {
        match raw.kind.as_str() {
            "text" => ContentBlock::Text(raw.text.unwrap_or_default()),
            "tool_use" => ContentBlock::ToolUse(ToolUse {
                id: raw.id,
                name: raw.name.unwrap_or_default(),
                input: raw.input,
            }),
            other => ContentBlock::Other(other.to_string()),
        }
    }
}

impl From<RawEvent> for StreamEvent {
    fn from(raw: RawEvent) -> Self {
        match (raw.kind.as_str(), raw.tool) {
            ("assistant", _) => StreamEvent::Assistant {
                content: raw
                    .message
                    .map(|message| message.content.into_iter().map(Into::into).collect())
                    .unwrap_or_default(),
            },
            ("tool_use", Some(tool)) => StreamEvent::ToolUse {
                tool: ToolUse {
                    id: raw.tool_use_id,
                    name: tool.name,
                    input: tool.input,
                },
            },
            ("tool_result", _) => StreamEvent::ToolResult {
                tool_use_id: raw.tool_use_id,
            },
            ("result", _) => StreamEvent::Result {
                subtype: raw.subtype,
                text: raw.result.unwrap_or_default(),
                is_error: raw.is_error,
                duration_ms: raw.duration_ms,
            },
            (other, _) => StreamEvent::Other {
                kind: other.to_string(),
                subtype: raw.subtype,
            },
        }
    }
}

/// Decode one line of agent output.
pub fn decode_event(line: &str) -> Result<StreamEvent, DecodeError> {
    let raw: RawEvent = serde_json::from_str(line.trim())?;
    Ok(raw.into())
}

/// What the agent is doing, derived from one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    /// Tool name when the activity is a tool invocation.
    pub tool: Option<String>,
    pub description: String,
}

/// Describe the agent's current activity, or `None` when the event carries nothing to report.
pub fn extract_activity(event: &StreamEvent) -> Option<Activity> {
    match event {
        StreamEvent::Assistant { content } => {
            if let Some(tool) = content.iter().find_map(|block| match block {
                ContentBlock::ToolUse(tool) => Some(tool),
                _ => None,
            }) {
                return Some(Activity {
                    tool: Some(tool.name.clone()),
                    description: describe_tool_use(&tool.name, &tool.input),
                });
            }
            content.iter().find_map(|block| match block {
                ContentBlock::Text(text) => text
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .map(|line| Activity {
                        tool: None,
                        description: truncate(line, 80),
                    }),
                _ => None,
            })
        }
        StreamEvent::Result { text, is_error, .. } => Some(Activity {
            tool: None,
            description: if *is_error {
                format!("Error: {}", truncate(text, 60))
            } else {
                "Completed".to_string()
            },
        }),
        StreamEvent::ToolUse { .. } | StreamEvent::ToolResult { .. } | StreamEvent::Other { .. } => {
            None
        }
    }
}

/// Input fields shared by the agent's built-in tools.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolInput {
    command: Option<String>,
    file_path: Option<String>,
    pattern: Option<String>,
    description: Option<String>,
    url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Render a human-readable description of a tool invocation.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let input: ToolInput = serde_json::from_value(input.clone()).unwrap_or_default();
    let file_path = non_empty(input.file_path);
    let pattern = non_empty(input.pattern);
    let description = non_empty(input.description);

    match name {
        "Read" => file_path
            .map(|path| format!("Reading: {}", shorten_path(&path)))
            .unwrap_or_else(|| "Reading file...".to_string()),
        "Edit" => file_path
            .map(|path| format!("Editing: {}", shorten_path(&path)))
            .unwrap_or_else(|| "Editing file...".to_string()),
        "Write" => file_path
            .map(|path| format!("Writing: {}", shorten_path(&path)))
            .unwrap_or_else(|| "Writing file...".to_string()),
        "Bash" => non_empty(input.command)
            .or(description)
            .map(|cmd| format!("Running: {}", truncate(&cmd, 50)))
            .unwrap_or_else(|| "Running command...".to_string()),
        "Glob" => pattern
            .map(|pattern| format!("Finding: {pattern}"))
            .unwrap_or_else(|| "Searching files...".to_string()),
        "Grep" => pattern
            .map(|pattern| format!("Searching: {}", truncate(&pattern, 40)))
            .unwrap_or_else(|| "Searching content...".to_string()),
        "Task" => description
            .map(|description| format!("Agent: {}", truncate(&description, 50)))
            .unwrap_or_else(|| "Spawning agent...".to_string()),
        "WebFetch" => non_empty(input.url)
            .map(|url| format!("Fetching: {}", truncate(&url, 50)))
            .unwrap_or_else(|| "Fetching URL...".to_string()),
        "WebSearch" => "Web search...".to_string(),
        "TodoWrite" => "Updating tasks...".to_string(),
        "AskUserQuestion" => "Asking question...".to_string(),
        other => format!("Using: {other}"),
    }
}

/// Shorten a path for display: paths over 50 chars collapse to `.../<parent>/<file>`.
pub fn shorten_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    if path.chars().count() <= 50 {
        return path;
    }
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() >= 2 {
        return format!(".../{}", parts[parts.len() - 2..].join("/"));
    }
    truncate(&path, 50)
}

/// Truncate to at most `max` characters, ending in `...` when shortened.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}
