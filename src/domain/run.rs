//! Run reports and run reconstruction from the operations log.
//!
//! A [`RunReport`] is returned by the runner at the end of a run. A
//! [`RunSummary`] is rebuilt later by replaying the logged events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactId;
use super::events::{Event, EventType};

/// Processing state of one document within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    #[default]
    Pending,

    Processing,

    Completed,

    /// At least one binding failed
    Failed,
}

/// A failed operation invocation, attached to the binding it applies to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingFailure {
    pub operation: String,
    pub document: ArtifactId,
    pub binding_key: String,
    pub error: String,
}

/// Outcome of processing one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: ArtifactId,
    pub status: DocumentStatus,

    /// Bindings whose operation body was invoked
    pub executed: usize,

    /// Bindings skipped because their outputs already exist
    pub skipped: usize,

    /// Fragments written during this run
    pub produced: Vec<ArtifactId>,

    pub failures: Vec<BindingFailure>,
}

impl DocumentReport {
    pub fn new(document: ArtifactId) -> Self {
        Self {
            document,
            status: DocumentStatus::Pending,
            executed: 0,
            skipped: 0,
            produced: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Aggregated result of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Per-document outcomes, in document order
    pub documents: Vec<DocumentReport>,

    /// Set when fail-fast stopped the run early
    pub aborted: bool,
}

impl RunReport {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            documents: Vec::new(),
            aborted: false,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &BindingFailure> {
        self.documents.iter().flat_map(|d| d.failures.iter())
    }

    pub fn executed(&self) -> usize {
        self.documents.iter().map(|d| d.executed).sum()
    }

    pub fn skipped(&self) -> usize {
        self.documents.iter().map(|d| d.skipped).sum()
    }

    pub fn produced(&self) -> usize {
        self.documents.iter().map(|d| d.produced.len()).sum()
    }

    /// True when no binding failed and the run was not aborted
    pub fn is_success(&self) -> bool {
        !self.aborted && self.failures().next().is_none()
    }

    pub fn document(&self, id: &ArtifactId) -> Option<&DocumentReport> {
        self.documents.iter().find(|d| &d.document == id)
    }
}

/// Overall state of a logged run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Started but never finished (still running or interrupted)
    Running,

    Completed,

    Aborted,
}

/// A run reconstructed from the operations log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub documents: BTreeMap<ArtifactId, DocumentStatus>,
    pub bindings_completed: usize,
    pub bindings_failed: usize,
    pub fragments_produced: usize,
}

impl RunSummary {
    /// Reconstruct one run from its events (must all share a run id)
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first = events.first()?;

        let mut summary = Self {
            run_id: first.run_id,
            state: RunState::Running,
            started_at: first.timestamp,
            completed_at: None,
            documents: BTreeMap::new(),
            bindings_completed: 0,
            bindings_failed: 0,
            fragments_produced: 0,
        };

        let run_id = summary.run_id;
        for event in events.iter().filter(|e| e.run_id == run_id) {
            summary.apply_event(event);
        }

        Some(summary)
    }

    /// Group a full log into runs, ordered by start time
    pub fn group(events: &[Event]) -> Vec<Self> {
        let mut by_run: BTreeMap<Uuid, Vec<Event>> = BTreeMap::new();
        for event in events {
            by_run.entry(event.run_id).or_default().push(event.clone());
        }

        let mut runs: Vec<Self> = by_run
            .values()
            .filter_map(|events| Self::from_events(events))
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    /// Apply a single event to update the summary
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                self.state = RunState::Running;
                self.started_at = event.timestamp;
            }
            EventType::RunCompleted => {
                self.state = RunState::Completed;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunAborted => {
                self.state = RunState::Aborted;
                self.completed_at = Some(event.timestamp);
            }
            EventType::DocumentStarted => self.set_document(event, DocumentStatus::Processing),
            EventType::DocumentCompleted => self.set_document(event, DocumentStatus::Completed),
            EventType::DocumentFailed => self.set_document(event, DocumentStatus::Failed),
            EventType::BindingCompleted => {
                self.bindings_completed += 1;
                self.fragments_produced += event.outputs.len();
            }
            EventType::BindingFailed => {
                self.bindings_failed += 1;
            }
        }
    }

    fn set_document(&mut self, event: &Event, status: DocumentStatus) {
        if let Some(ref document) = event.document {
            self.documents.insert(document.clone(), status);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state != RunState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding_event(run_id: Uuid, event_type: EventType, doc: &ArtifactId) -> Event {
        Event::for_binding(run_id, event_type, "op", doc, "key", "label", "binding")
    }

    #[test]
    fn test_summary_from_events() {
        let run_id = Uuid::new_v4();
        let doc = ArtifactId::new("doc1");

        let events = vec![
            Event::new(run_id, EventType::RunStarted, "Run started"),
            Event::for_document(run_id, EventType::DocumentStarted, &doc, "started"),
            binding_event(run_id, EventType::BindingCompleted, &doc)
                .with_outputs(vec![ArtifactId::new("a"), ArtifactId::new("b")]),
            binding_event(run_id, EventType::BindingFailed, &doc).with_error("boom".to_string()),
            Event::for_document(run_id, EventType::DocumentFailed, &doc, "failed"),
            Event::new(run_id, EventType::RunCompleted, "Run completed"),
        ];

        let summary = RunSummary::from_events(&events).unwrap();

        assert_eq!(summary.run_id, run_id);
        assert_eq!(summary.state, RunState::Completed);
        assert_eq!(summary.bindings_completed, 1);
        assert_eq!(summary.bindings_failed, 1);
        assert_eq!(summary.fragments_produced, 2);
        assert_eq!(summary.documents.get(&doc), Some(&DocumentStatus::Failed));
        assert!(summary.is_finished());
    }

    #[test]
    fn test_interrupted_run_stays_running() {
        let run_id = Uuid::new_v4();
        let doc = ArtifactId::new("doc1");
        let events = vec![
            Event::new(run_id, EventType::RunStarted, "Run started"),
            Event::for_document(run_id, EventType::DocumentStarted, &doc, "started"),
        ];

        let summary = RunSummary::from_events(&events).unwrap();
        assert_eq!(summary.state, RunState::Running);
        assert_eq!(summary.documents.get(&doc), Some(&DocumentStatus::Processing));
    }

    #[test]
    fn test_from_events_ignores_other_runs() {
        let run_id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let doc = ArtifactId::new("doc1");
        let events = vec![
            Event::new(run_id, EventType::RunStarted, "Run started"),
            binding_event(other, EventType::BindingFailed, &doc).with_error("elsewhere".to_string()),
            binding_event(run_id, EventType::BindingCompleted, &doc),
            Event::new(other, EventType::RunAborted, "Run aborted"),
        ];

        let summary = RunSummary::from_events(&events).unwrap();
        assert_eq!(summary.run_id, run_id);
        assert_eq!(summary.state, RunState::Running);
        assert_eq!(summary.bindings_completed, 1);
        assert_eq!(summary.bindings_failed, 0);
    }

    #[test]
    fn test_group_splits_runs() {
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let events = vec![
            Event::new(first, EventType::RunStarted, "first"),
            Event::new(first, EventType::RunCompleted, "first done"),
            Event::new(second, EventType::RunStarted, "second"),
        ];

        let runs = RunSummary::group(&events);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, first);
        assert_eq!(runs[1].state, RunState::Running);
    }

    #[test]
    fn test_report_totals() {
        let mut report = RunReport::new(Uuid::new_v4());
        let mut doc = DocumentReport::new(ArtifactId::new("doc1"));
        doc.executed = 2;
        doc.skipped = 1;
        doc.produced = vec![ArtifactId::new("x")];
        report.documents.push(doc);

        assert_eq!(report.executed(), 2);
        assert_eq!(report.skipped(), 1);
        assert_eq!(report.produced(), 1);
        assert!(report.is_success());

        report.documents[0].failures.push(BindingFailure {
            operation: "op".to_string(),
            document: ArtifactId::new("doc1"),
            binding_key: "k".to_string(),
            error: "boom".to_string(),
        });
        assert!(!report.is_success());
    }
}
