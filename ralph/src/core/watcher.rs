//! Incremental observation of a single run's output.
//!
//! The watcher accumulates the decoded transcript of one agent run and reports
//! changes as they happen: a newly announced story, a shift in execution
//! phase, or a change in the strongest control marker seen so far. It is
//! reset by constructing a new watcher per run.

use std::fmt;

use crate::core::signals::{
    Signal, SignalKind, StoryAnnouncement, detect_signal, detect_story_announcement,
};

/// Coarse execution phase, guessed from keywords in the agent's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Research,
    Planning,
    Implementation,
    QualityGates,
    Committing,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "Research",
            Phase::Planning => "Planning",
            Phase::Implementation => "Implementation",
            Phase::QualityGates => "Quality Gates",
            Phase::Committing => "Committing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const PHASE_KEYWORDS: [(Phase, &[&str]); 5] = [
    (
        Phase::Research,
        &["research", "exploring", "reading file", "searching"],
    ),
    (Phase::Planning, &["planning", "designing", "approach"]),
    (
        Phase::Implementation,
        &[
            "implementing",
            "writing",
            "creating",
            "modifying",
            "editing file",
        ],
    ),
    (
        Phase::QualityGates,
        &["quality gate", "typecheck", "lint", "test", "npm run"],
    ),
    (Phase::Committing, &["commit", "git add"]),
];

/// Guess the phase a single line belongs to. First matching phase wins.
pub fn detect_phase(line: &str) -> Option<Phase> {
    let line = line.to_lowercase();
    PHASE_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| line.contains(keyword)))
        .map(|(phase, _)| *phase)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    StoryAnnounced(StoryAnnouncement),
    PhaseChanged(Phase),
    SignalChanged(Signal),
}

#[derive(Debug, Default)]
pub struct OutputWatcher {
    transcript: String,
    story_id: Option<String>,
    phase: Option<Phase>,
    signal: Option<SignalKind>,
}

impl OutputWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `text` to the transcript and report what changed.
    pub fn observe(&mut self, text: &str) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        self.transcript.push_str(text);
        self.transcript.push('\n');

        // Blocks can span many lines, so closing tags trigger a rescan of the whole transcript.
        if text.contains("</ralph-story>")
            && let Some(announcement) = detect_story_announcement(&self.transcript)
            && self.story_id.as_deref() != Some(announcement.id.as_str())
        {
            self.story_id = Some(announcement.id.clone());
            events.push(WatchEvent::StoryAnnounced(announcement));
        }

        for line in text.lines() {
            if let Some(phase) = detect_phase(line)
                && self.phase != Some(phase)
            {
                self.phase = Some(phase);
                events.push(WatchEvent::PhaseChanged(phase));
            }
        }

        if text.contains("</ralph-") || text.contains("</promise>") {
            let signal = detect_signal(&self.transcript);
            if signal.kind() != SignalKind::None && self.signal != Some(signal.kind()) {
                self.signal = Some(signal.kind());
                events.push(WatchEvent::SignalChanged(signal));
            }
        }

        events
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn into_transcript(self) -> String {
        self.transcript
    }
}
