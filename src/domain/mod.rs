//! Domain types for the catalyst engine.
//!
//! This module contains the core data structures:
//! - Artifact: Documents and the fragments derived from them
//! - Events: Immutable records of binding outcomes
//! - Run: Run reports and summaries rebuilt from events

pub mod artifact;
pub mod events;
pub mod run;

pub use artifact::{Artifact, ArtifactId, ArtifactKind, Document, Fragment, Metadata};
pub use events::{Event, EventFilter, EventType};
pub use run::{BindingFailure, DocumentReport, DocumentStatus, RunReport, RunState, RunSummary};
