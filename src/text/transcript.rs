use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::protocol::{StepStatus, StreamEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Message,
    Plan,
    Step,
    Tool,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Author {
    User,
    Agent,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub status: Option<StepStatus>,
    pub step_id: Option<String>,
    pub tool: Option<String>,
    pub action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: Uuid,
    pub kind: EntryKind,
    pub author: Author,
    pub text: String,
    pub metadata: EntryMetadata,
    pub created_at: DateTime<Utc>,
}

impl TranscriptEntry {
    fn new(kind: EntryKind, author: Author, text: String, metadata: EntryMetadata) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            author,
            text,
            metadata,
            created_at: Utc::now(),
        }
    }
}

/// How repeated `step` events are folded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StepPolicy {
    /// Every `step` event is a new entry.
    Append,
    /// A `step` carrying an id updates the earlier entry with that id; steps
    /// without an id are always new entries.
    #[default]
    UpdateById,
}

/// Observable effect of folding one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TranscriptChange {
    Appended { id: Uuid },
    Updated { id: Uuid },
    TitleChanged { title: String },
    TurnClosed,
}

/// Ordered conversation log for one session.
///
/// Entries are only ever appended or edited in place; the core never
/// reorders or removes them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    title: Option<String>,
    awaiting_response: bool,
    #[serde(skip)]
    open_message: Option<usize>,
    #[serde(skip)]
    step_policy: StepPolicy,
}

impl Transcript {
    pub fn new(step_policy: StepPolicy) -> Self {
        Self {
            step_policy,
            ..Default::default()
        }
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    /// Whether a further `message` delta would be merged into the last entry.
    pub fn has_open_message(&self) -> bool {
        self.open_message.is_some()
    }

    pub fn get(&self, id: Uuid) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Records the outbound user message and opens a new turn.
    pub fn push_user_message(&mut self, text: impl Into<String>) -> TranscriptChange {
        self.open_message = None;
        self.awaiting_response = true;
        self.push(TranscriptEntry::new(
            EntryKind::Message,
            Author::User,
            text.into(),
            EntryMetadata::default(),
        ))
    }

    pub fn apply(&mut self, event: StreamEvent) -> TranscriptChange {
        match event {
            StreamEvent::Message { content } => self.append_delta(content),
            StreamEvent::Title { content } => {
                self.title = Some(content.clone());
                TranscriptChange::TitleChanged { title: content }
            }
            StreamEvent::Plan { content } => {
                self.push_agent(EntryKind::Plan, content, EntryMetadata::default())
            }
            StreamEvent::Step {
                content,
                status,
                id,
            } => self.apply_step(content, status, id),
            StreamEvent::Tool {
                content,
                tool,
                action,
            } => self.push_agent(
                EntryKind::Tool,
                content,
                EntryMetadata {
                    tool: Some(tool),
                    action: Some(action),
                    ..Default::default()
                },
            ),
            StreamEvent::Error { content } => {
                self.push_agent(EntryKind::Error, content, EntryMetadata::default())
            }
            StreamEvent::Done => {
                self.open_message = None;
                self.awaiting_response = false;
                TranscriptChange::TurnClosed
            }
        }
    }

    /// Surfaces an undecodable frame as a visible `error` entry.
    pub fn apply_decode_error(&mut self, error: &DecodeError) -> TranscriptChange {
        self.push_agent(
            EntryKind::Error,
            format!("Could not decode stream event: {error}"),
            EntryMetadata::default(),
        )
    }

    fn append_delta(&mut self, delta: String) -> TranscriptChange {
        if let Some(idx) = self.open_message {
            // Only the most recent entry may absorb deltas.
            if idx + 1 == self.entries.len() {
                let entry = &mut self.entries[idx];
                entry.text.push_str(&delta);
                return TranscriptChange::Updated { id: entry.id };
            }
        }

        let change = self.push_agent(EntryKind::Message, delta, EntryMetadata::default());
        self.open_message = Some(self.entries.len() - 1);
        change
    }

    fn apply_step(
        &mut self,
        content: String,
        status: StepStatus,
        step_id: Option<String>,
    ) -> TranscriptChange {
        if self.step_policy == StepPolicy::UpdateById {
            if let Some(step_id) = step_id.as_deref() {
                let existing = self.entries.iter_mut().rev().find(|entry| {
                    entry.kind == EntryKind::Step
                        && entry.metadata.step_id.as_deref() == Some(step_id)
                });
                if let Some(entry) = existing {
                    entry.metadata.status = Some(status);
                    if !content.is_empty() {
                        entry.text = content;
                    }
                    return TranscriptChange::Updated { id: entry.id };
                }
            }
        }

        self.push_agent(
            EntryKind::Step,
            content,
            EntryMetadata {
                status: Some(status),
                step_id,
                ..Default::default()
            },
        )
    }

    fn push_agent(
        &mut self,
        kind: EntryKind,
        text: String,
        metadata: EntryMetadata,
    ) -> TranscriptChange {
        // Any agent output opens a turn implicitly, even without a local message.
        self.awaiting_response = true;
        self.push(TranscriptEntry::new(kind, Author::Agent, text, metadata))
    }

    fn push(&mut self, entry: TranscriptEntry) -> TranscriptChange {
        let id = entry.id;
        self.entries.push(entry);
        TranscriptChange::Appended { id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(content: &str) -> StreamEvent {
        StreamEvent::message(content)
    }

    fn step(content: &str, status: StepStatus, id: Option<&str>) -> StreamEvent {
        StreamEvent::Step {
            content: content.to_string(),
            status,
            id: id.map(str::to_string),
        }
    }

    #[test]
    fn deltas_in_one_turn_merge_into_one_entry() {
        let mut transcript = Transcript::default();
        transcript.push_user_message("hi");
        transcript.apply(message("Hel"));
        transcript.apply(message("lo"));
        let change = transcript.apply(StreamEvent::Done);

        assert_eq!(change, TranscriptChange::TurnClosed);
        let entries = transcript.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].author, Author::Agent);
        assert_eq!(entries[1].kind, EntryKind::Message);
        assert_eq!(entries[1].text, "Hello");
        assert!(!transcript.awaiting_response());
        assert!(!transcript.has_open_message());
    }

    #[test]
    fn many_deltas_concatenate_in_arrival_order() {
        let mut transcript = Transcript::default();
        let deltas: Vec<String> = (0..50).map(|n| format!("t{n} ")).collect();
        for delta in &deltas {
            transcript.apply(message(delta));
        }

        assert_eq!(transcript.entries().len(), 1);
        assert_eq!(transcript.entries()[0].text, deltas.concat());
    }

    #[test]
    fn message_after_done_starts_new_entry() {
        let mut transcript = Transcript::default();
        transcript.apply(message("first"));
        transcript.apply(StreamEvent::Done);
        let change = transcript.apply(message("second"));

        assert!(matches!(change, TranscriptChange::Appended { .. }));
        assert_eq!(transcript.entries().len(), 2);
        assert_eq!(transcript.entries()[0].text, "first");
        assert_eq!(transcript.entries()[1].text, "second");
    }

    #[test]
    fn non_message_events_never_merge() {
        let mut transcript = Transcript::default();
        transcript.apply(message("looking"));
        transcript.apply(StreamEvent::Plan {
            content: "1. read".to_string(),
        });
        transcript.apply(message(" done"));

        let kinds: Vec<EntryKind> = transcript.entries().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![EntryKind::Message, EntryKind::Plan, EntryKind::Message]
        );
        assert_eq!(transcript.entries()[2].text, " done");
    }

    #[test]
    fn user_message_is_never_merged_with_agent_delta() {
        let mut transcript = Transcript::default();
        transcript.push_user_message("question");
        transcript.apply(message("answer"));

        assert_eq!(transcript.entries().len(), 2);
        assert_eq!(transcript.entries()[0].author, Author::User);
    }

    #[test]
    fn title_does_not_touch_entries() {
        let mut transcript = Transcript::default();
        transcript.apply(message("a"));
        transcript.apply(StreamEvent::Title {
            content: "Report".to_string(),
        });
        transcript.apply(message("b"));

        assert_eq!(transcript.title(), Some("Report"));
        assert_eq!(transcript.entries().len(), 1);
        assert_eq!(transcript.entries()[0].text, "ab");
    }

    #[test]
    fn tool_event_carries_metadata() {
        let mut transcript = Transcript::default();
        transcript.apply(StreamEvent::Tool {
            content: "cat README.md".to_string(),
            tool: "shell".to_string(),
            action: "exec".to_string(),
        });

        let entry = &transcript.entries()[0];
        assert_eq!(entry.kind, EntryKind::Tool);
        assert_eq!(entry.metadata.tool.as_deref(), Some("shell"));
        assert_eq!(entry.metadata.action.as_deref(), Some("exec"));
    }

    #[test]
    fn step_with_id_updates_under_update_by_id() {
        let mut transcript = Transcript::new(StepPolicy::UpdateById);
        let first = transcript.apply(step("build", StepStatus::Running, Some("s1")));
        transcript.apply(message("working"));
        let second = transcript.apply(step("", StepStatus::Completed, Some("s1")));

        let TranscriptChange::Appended { id } = first else {
            panic!("expected append");
        };
        assert_eq!(second, TranscriptChange::Updated { id });
        assert_eq!(transcript.entries().len(), 2);
        let entry = transcript.get(id).unwrap();
        assert_eq!(entry.metadata.status, Some(StepStatus::Completed));
        assert_eq!(entry.text, "build");
    }

    #[test]
    fn step_with_id_appends_under_append_policy() {
        let mut transcript = Transcript::new(StepPolicy::Append);
        transcript.apply(step("build", StepStatus::Running, Some("s1")));
        transcript.apply(step("build", StepStatus::Failed, Some("s1")));

        let statuses: Vec<_> = transcript
            .entries()
            .iter()
            .map(|e| e.metadata.status)
            .collect();
        assert_eq!(
            statuses,
            vec![Some(StepStatus::Running), Some(StepStatus::Failed)]
        );
    }

    #[test]
    fn steps_without_id_are_independent_under_either_policy() {
        for policy in [StepPolicy::Append, StepPolicy::UpdateById] {
            let mut transcript = Transcript::new(policy);
            transcript.apply(step("a", StepStatus::Running, None));
            transcript.apply(step("a", StepStatus::Completed, None));
            assert_eq!(transcript.entries().len(), 2, "{policy:?}");
        }
    }

    #[test]
    fn decode_error_becomes_error_entry_and_breaks_merge() {
        let mut transcript = Transcript::default();
        transcript.apply(message("par"));
        transcript.apply_decode_error(&DecodeError::UnknownType("ping".to_string()));
        transcript.apply(message("tial"));

        let entries = transcript.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].kind, EntryKind::Error);
        assert!(entries[1].text.contains("ping"));
        assert_eq!(entries[2].text, "tial");
    }

    #[test]
    fn entry_ids_are_unique() {
        let mut transcript = Transcript::default();
        for n in 0..20 {
            transcript.apply(StreamEvent::Plan {
                content: n.to_string(),
            });
        }
        let mut ids: Vec<Uuid> = transcript.entries().iter().map(|e| e.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }
}
