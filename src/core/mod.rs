//! Core engine.
//!
//! This module contains:
//! - Repository: Durable artifact storage and the operations log
//! - Operation: Operation contracts and the ordered registry
//! - Matcher: Binding computation against stored artifacts
//! - Runner: The fixed-order execution loop
//! - Graph: Pipeline export and Mermaid rendering

pub mod graph;
pub mod matcher;
pub mod operation;
pub mod repository;
pub mod runner;

// Re-export commonly used types
pub use graph::{ArtifactNode, Edge, OperationNode, PipelineGraph};
pub use matcher::Binding;
pub use operation::{
    Argument, Arguments, AsyncFnBody, FnBody, Multiplicity, Operation, OperationBody,
    OperationBuilder, OperationContext, OperationError, OperationRegistry, OperationResult,
    Output, OutputSpec, ParamSpec, RegistryError, Scope, Services,
};
pub use repository::{ArtifactQuery, IndexEntry, LocalRepository, Repository, RepositoryError};
pub use runner::{EngineError, RunOptions, Runner};
