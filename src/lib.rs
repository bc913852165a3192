//! catalyst - Resumable document-to-artifact pipeline engine
//!
//! A caller registers an ordered list of typed operations, seeds a
//! repository with documents, and runs the engine. Each operation is applied
//! to every matching artifact produced so far; every result is persisted so
//! an interrupted run resumes without recomputation.
//!
//! # Architecture
//!
//! - Artifacts are immutable and content-addressed
//! - Operations run in registration order, once per document
//! - Binding outcomes are recorded in an append-only operations log
//! - A binding whose completion is logged (and whose outputs survive) is skipped
//!
//! # Modules
//!
//! - `domain`: Data structures (Artifact, Event, RunReport)
//! - `core`: Repository, operation registry, matcher, runner, graph export
//! - `pipelines`: Built-in text pipeline
//! - `config`: Configuration discovery
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Seed the repository
//! catalyst add 'docs/*.md'
//!
//! # Run the text pipeline (re-running skips completed work)
//! catalyst run
//!
//! # Inspect results
//! catalyst ls --label summary
//! catalyst describe
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod pipelines;

// Re-export main types at crate root for convenience
pub use core::{
    LocalRepository, Operation, OperationRegistry, OutputSpec, ParamSpec, PipelineGraph,
    Repository, RunOptions, Runner,
};
pub use domain::{Artifact, ArtifactId, ArtifactKind, Document, Fragment, RunReport};
