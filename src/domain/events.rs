//! Operations log events.
//!
//! Every binding outcome and every run/document transition is recorded as
//! an immutable event in an append-only log. The completion events are the
//! source of truth for resumability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::artifact::ArtifactId;

/// A single event in the operations log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Type of event
    pub event_type: EventType,

    /// Operation name (binding events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Root document the event applies to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<ArtifactId>,

    /// Binding key (binding events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding_key: Option<String>,

    /// Output label of the operation (binding events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Fragments written by a completed binding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<ArtifactId>,

    /// Human-readable summary (no content)
    pub payload_summary: String,

    /// Time taken in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(run_id: Uuid, event_type: EventType, payload_summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            event_type,
            operation: None,
            document: None,
            binding_key: None,
            label: None,
            outputs: Vec::new(),
            payload_summary: payload_summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    /// Create a document-level event
    pub fn for_document(
        run_id: Uuid,
        event_type: EventType,
        document: &ArtifactId,
        payload_summary: impl Into<String>,
    ) -> Self {
        let mut event = Self::new(run_id, event_type, payload_summary);
        event.document = Some(document.clone());
        event
    }

    /// Create a binding-level event
    pub fn for_binding(
        run_id: Uuid,
        event_type: EventType,
        operation: &str,
        document: &ArtifactId,
        binding_key: &str,
        label: &str,
        payload_summary: impl Into<String>,
    ) -> Self {
        let mut event = Self::for_document(run_id, event_type, document, payload_summary);
        event.operation = Some(operation.to_string());
        event.binding_key = Some(binding_key.to_string());
        event.label = Some(label.to_string());
        event
    }

    pub fn with_outputs(mut self, outputs: Vec<ArtifactId>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    /// True for a completion of the given operation binding
    pub fn completes(&self, operation: &str, document: &ArtifactId, label: &str, binding_key: &str) -> bool {
        self.event_type == EventType::BindingCompleted
            && self.operation.as_deref() == Some(operation)
            && self.document.as_ref() == Some(document)
            && self.label.as_deref() == Some(label)
            && self.binding_key.as_deref() == Some(binding_key)
    }
}

/// Types of events recorded in the operations log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,

    RunCompleted,

    /// The run stopped early (fail-fast)
    RunAborted,

    DocumentStarted,

    DocumentCompleted,

    /// At least one binding failed for the document
    DocumentFailed,

    /// An operation binding executed and its outputs were stored
    BindingCompleted,

    /// An operation body returned an error or a non-compliant result
    BindingFailed,
}

/// Filter for reading back the operations log
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub run_id: Option<Uuid>,
    pub operation: Option<String>,
    pub document: Option<ArtifactId>,
    pub event_type: Option<EventType>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.run_id.map_or(true, |id| event.run_id == id)
            && self
                .operation
                .as_deref()
                .map_or(true, |op| event.operation.as_deref() == Some(op))
            && self
                .document
                .as_ref()
                .map_or(true, |doc| event.document.as_ref() == Some(doc))
            && self.event_type.map_or(true, |t| event.event_type == t)
    }
}
