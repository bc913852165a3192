//! Operation descriptors and the registry holding them.
//!
//! An operation declares what it consumes (ordered [`ParamSpec`]s) and what
//! it produces (an [`OutputSpec`]). The body itself is opaque to the
//! engine: it receives bound [`Arguments`] plus an [`OperationContext`] and
//! returns an [`OperationResult`].
//!
//! Registration order is the execution order. Declared types are used for
//! matching only, never for sequencing.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Artifact, ArtifactId, ArtifactKind, Metadata};

/// Errors raised while registering operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Operation name cannot be empty")]
    EmptyName,

    #[error("Operation '{0}' is already registered")]
    DuplicateName(String),

    #[error("Operation '{0}' must declare at least one input")]
    NoInputs(String),

    #[error("Operation '{0}' must declare an output")]
    MissingOutput(String),

    #[error("Operation '{0}' has no body")]
    MissingBody(String),

    #[error("Operation '{0}' declares an empty output label")]
    EmptyOutputLabel(String),

    #[error("Operation '{0}' cannot produce documents")]
    DocumentOutput(String),

    #[error("Operation '{operation}' outputs label '{label}' already produced by '{existing}'")]
    DuplicateOutputLabel {
        label: String,
        operation: String,
        existing: String,
    },
}

/// Failure of a single operation invocation.
///
/// Attached to the binding it happened on; never fatal to the run.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("{0:#}")]
    Execution(anyhow::Error),

    #[error("Non-compliant result: {0}")]
    NonCompliant(String),

    #[error("Operation task failed: {0}")]
    Join(String),

    #[error("Output {0} conflicts with a stored artifact")]
    Conflict(ArtifactId),
}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<OperationError>() {
            Ok(op) => op,
            Err(err) => OperationError::Execution(err),
        }
    }
}

/// How many artifacts a parameter or output binds to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    /// One artifact per invocation (fan-out over candidates)
    #[default]
    One,

    /// The full candidate set in a single invocation (fan-in)
    Many,
}

/// Which documents `Many` parameters gather candidates from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Only the document being processed
    #[default]
    Document,

    /// Every document in the repository
    All,
}

/// Declared input of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ArtifactKind,
    pub label: Option<String>,
    pub multiplicity: Multiplicity,

    /// Allow an empty candidate pool
    #[serde(default)]
    pub optional: bool,
}

impl ParamSpec {
    pub fn one(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
            label: None,
            multiplicity: Multiplicity::One,
            optional: false,
        }
    }

    pub fn many(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            multiplicity: Multiplicity::Many,
            ..Self::one(name, kind)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// True if `artifact` can satisfy this parameter
    pub fn accepts(&self, artifact: &Artifact) -> bool {
        artifact.kind() == self.kind
            && self
                .label
                .as_deref()
                .map_or(true, |label| artifact.label() == Some(label))
    }
}

impl std::fmt::Display for ParamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.kind)?;
        if self.multiplicity == Multiplicity::Many {
            f.write_str("*")?;
        }
        if let Some(ref label) = self.label {
            write!(f, "[{}]", label)?;
        }
        if self.optional {
            f.write_str("?")?;
        }
        Ok(())
    }
}

/// Declared output of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub kind: ArtifactKind,
    pub label: String,
    pub multiplicity: Multiplicity,
}

impl OutputSpec {
    pub fn one(kind: ArtifactKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            multiplicity: Multiplicity::One,
        }
    }

    pub fn many(kind: ArtifactKind, label: impl Into<String>) -> Self {
        Self {
            multiplicity: Multiplicity::Many,
            ..Self::one(kind, label)
        }
    }

    /// Check a result against this spec and number its outputs.
    ///
    /// A `Single` result gets ordinal 0; the elements of a `Many` result get
    /// `1..=N`. Outputs that leave their kind unset inherit the declared one.
    pub fn accept(&self, result: OperationResult) -> Result<Vec<(u32, Output)>, OperationError> {
        let numbered: Vec<(u32, Output)> = match (self.multiplicity, result) {
            (Multiplicity::One, OperationResult::Single(output)) => vec![(0, output)],
            (Multiplicity::Many, OperationResult::Many(outputs)) => {
                (1u32..).zip(outputs).collect()
            }
            (Multiplicity::One, OperationResult::Many(outputs)) => {
                return Err(OperationError::NonCompliant(format!(
                    "expected a single {}, got a list of {}",
                    self.kind,
                    outputs.len()
                )));
            }
            (Multiplicity::Many, OperationResult::Single(_)) => {
                return Err(OperationError::NonCompliant(format!(
                    "expected a list of {}, got a single value",
                    self.kind
                )));
            }
        };

        numbered
            .into_iter()
            .map(|(ordinal, mut output)| match output.kind {
                Some(kind) if kind != self.kind => Err(OperationError::NonCompliant(format!(
                    "output {} has kind {}, expected {}",
                    ordinal, kind, self.kind
                ))),
                _ => {
                    output.kind = Some(self.kind);
                    Ok((ordinal, output))
                }
            })
            .collect()
    }
}

impl std::fmt::Display for OutputSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if self.multiplicity == Multiplicity::Many {
            f.write_str("*")?;
        }
        write!(f, "[{}]", self.label)
    }
}

/// An artifact-shaped value returned by an operation body.
///
/// The engine assigns identity, label, ordinal and source when wrapping it
/// into a fragment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Output {
    pub kind: Option<ArtifactKind>,
    pub content: Vec<u8>,
    pub mime_type: Option<String>,
    pub metadata: Metadata,
    pub vector: Option<Vec<f32>>,
}

impl Output {
    pub fn new(kind: ArtifactKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }

    /// Set UTF-8 text content (mime type defaults to text/plain)
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.content = text.into().into_bytes();
        if self.mime_type.is_none() {
            self.mime_type = Some("text/plain".to_string());
        }
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }
}

/// Value returned by an operation body
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult {
    Single(Output),
    Many(Vec<Output>),
}

impl From<Output> for OperationResult {
    fn from(output: Output) -> Self {
        OperationResult::Single(output)
    }
}

impl From<Vec<Output>> for OperationResult {
    fn from(outputs: Vec<Output>) -> Self {
        OperationResult::Many(outputs)
    }
}

/// One bound parameter value
#[derive(Debug, Clone)]
pub enum Argument {
    One(Artifact),
    Many(Vec<Artifact>),

    /// Optional `One` parameter with no candidate
    Absent,
}

/// Bound arguments, one per declared parameter, in declaration order
#[derive(Debug, Clone, Default)]
pub struct Arguments(Vec<Argument>);

impl Arguments {
    pub fn new(arguments: Vec<Argument>) -> Self {
        Self(arguments)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Argument> {
        self.0.iter()
    }

    /// The artifact bound to a `One` parameter
    pub fn one(&self, index: usize) -> Result<&Artifact> {
        match self.0.get(index) {
            Some(Argument::One(artifact)) => Ok(artifact),
            Some(Argument::Absent) => Err(anyhow!("Argument {} is absent", index)),
            Some(Argument::Many(_)) => Err(anyhow!("Argument {} is a list", index)),
            None => Err(anyhow!("No argument at position {}", index)),
        }
    }

    /// The artifacts bound to a `Many` parameter
    pub fn many(&self, index: usize) -> Result<&[Artifact]> {
        match self.0.get(index) {
            Some(Argument::Many(artifacts)) => Ok(artifacts),
            Some(_) => Err(anyhow!("Argument {} is not a list", index)),
            None => Err(anyhow!("No argument at position {}", index)),
        }
    }

    /// The artifact bound to an optional `One` parameter, if any
    pub fn optional(&self, index: usize) -> Option<&Artifact> {
        match self.0.get(index) {
            Some(Argument::One(artifact)) => Some(artifact),
            _ => None,
        }
    }
}

/// Typed map of shared clients handed to operation bodies
#[derive(Default)]
pub struct Services {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Send + Sync + 'static>(&mut self, service: T) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    pub fn with<T: Send + Sync + 'static>(mut self, service: T) -> Self {
        self.insert(service);
        self
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|service| Arc::clone(service).downcast::<T>().ok())
    }

    /// Like [`Services::get`] but errors when the service is missing
    pub fn require<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.get::<T>()
            .ok_or_else(|| anyhow!("Service {} is not registered", std::any::type_name::<T>()))
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Explicit, run-scoped context handed to every invocation
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub run_id: Uuid,
    pub operation: String,
    pub document: ArtifactId,
    services: Arc<Services>,
}

impl OperationContext {
    pub fn new(run_id: Uuid, operation: impl Into<String>, document: ArtifactId, services: Arc<Services>) -> Self {
        Self {
            run_id,
            operation: operation.into(),
            document,
            services,
        }
    }

    pub fn services(&self) -> &Services {
        &self.services
    }
}

/// The callable part of an operation
#[async_trait]
pub trait OperationBody: Send + Sync {
    async fn call(&self, ctx: &OperationContext, args: Arguments) -> Result<OperationResult>;
}

/// Body wrapping a synchronous, possibly blocking function.
///
/// Calls run on the blocking thread pool.
pub struct FnBody<F>(Arc<F>);

impl<F> FnBody<F>
where
    F: Fn(&OperationContext, Arguments) -> Result<OperationResult> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl<F> OperationBody for FnBody<F>
where
    F: Fn(&OperationContext, Arguments) -> Result<OperationResult> + Send + Sync + 'static,
{
    async fn call(&self, ctx: &OperationContext, args: Arguments) -> Result<OperationResult> {
        let f = Arc::clone(&self.0);
        let name = ctx.operation.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || f(&ctx, args))
            .await
            .map_err(|e| anyhow::Error::new(OperationError::Join(format!("{}: {}", name, e))))?
    }
}

/// Body wrapping an async function
pub struct AsyncFnBody<F>(F);

#[async_trait]
impl<F, Fut> OperationBody for AsyncFnBody<F>
where
    F: Fn(OperationContext, Arguments) -> Fut + Send + Sync,
    Fut: Future<Output = Result<OperationResult>> + Send,
{
    async fn call(&self, ctx: &OperationContext, args: Arguments) -> Result<OperationResult> {
        (self.0)(ctx.clone(), args).await
    }
}

/// A registered unit of work
#[derive(Clone)]
pub struct Operation {
    pub name: String,
    pub description: Option<String>,
    pub inputs: Vec<ParamSpec>,
    pub output: OutputSpec,
    pub scope: Scope,
    body: Arc<dyn OperationBody>,
}

impl Operation {
    pub fn builder(name: impl Into<String>) -> OperationBuilder {
        OperationBuilder {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            output: None,
            scope: Scope::default(),
            body: None,
        }
    }

    pub async fn invoke(&self, ctx: &OperationContext, args: Arguments) -> Result<OperationResult> {
        self.body.call(ctx, args).await
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("output", &self.output)
            .field("scope", &self.scope)
            .finish()
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inputs: Vec<String> = self.inputs.iter().map(ToString::to_string).collect();
        write!(f, "{}({}) -> {}", self.name, inputs.join(", "), self.output)
    }
}

/// Builder for [`Operation`]
pub struct OperationBuilder {
    name: String,
    description: Option<String>,
    inputs: Vec<ParamSpec>,
    output: Option<OutputSpec>,
    scope: Scope,
    body: Option<Arc<dyn OperationBody>>,
}

impl OperationBuilder {
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input(mut self, spec: ParamSpec) -> Self {
        self.inputs.push(spec);
        self
    }

    pub fn output(mut self, spec: OutputSpec) -> Self {
        self.output = Some(spec);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn body(mut self, body: impl OperationBody + 'static) -> Self {
        self.body = Some(Arc::new(body));
        self
    }

    /// Use a synchronous function as the body
    pub fn handler<F>(self, f: F) -> Self
    where
        F: Fn(&OperationContext, Arguments) -> Result<OperationResult> + Send + Sync + 'static,
    {
        self.body(FnBody::new(f))
    }

    /// Use an async function as the body
    pub fn async_handler<F, Fut>(self, f: F) -> Self
    where
        F: Fn(OperationContext, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<OperationResult>> + Send + 'static,
    {
        self.body(AsyncFnBody(f))
    }

    pub fn build(self) -> Result<Operation, RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if self.inputs.is_empty() {
            return Err(RegistryError::NoInputs(self.name));
        }
        let output = self
            .output
            .ok_or_else(|| RegistryError::MissingOutput(self.name.clone()))?;
        if output.label.trim().is_empty() {
            return Err(RegistryError::EmptyOutputLabel(self.name));
        }
        if output.kind == ArtifactKind::Document {
            return Err(RegistryError::DocumentOutput(self.name));
        }
        let body = self
            .body
            .ok_or_else(|| RegistryError::MissingBody(self.name.clone()))?;

        Ok(Operation {
            name: self.name,
            description: self.description,
            inputs: self.inputs,
            output,
            scope: self.scope,
            body,
        })
    }
}

/// Ordered collection of operations
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: Vec<Operation>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation; its position is its execution order
    pub fn register(&mut self, operation: Operation) -> Result<&mut Self, RegistryError> {
        if self.get(&operation.name).is_some() {
            return Err(RegistryError::DuplicateName(operation.name));
        }

        // Two producers of one label would make matches ambiguous
        if let Some(existing) = self
            .operations
            .iter()
            .find(|op| op.output.label == operation.output.label)
        {
            return Err(RegistryError::DuplicateOutputLabel {
                label: operation.output.label.clone(),
                operation: operation.name,
                existing: existing.name.clone(),
            });
        }

        self.operations.push(operation);
        Ok(self)
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn get(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}
