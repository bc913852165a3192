//! Pipeline execution engine.
//!
//! The runner visits every registered operation once per document, in
//! registration order. Each binding is either skipped (its completion is
//! already logged and its outputs survive) or executed, validated and
//! written back to the repository. Operation failures are isolated to their
//! binding; repository failures abort the run.
//!
//! Operations with [`Scope::All`] read other documents' artifacts, so the
//! registry is cut into phases in front of each of them. Every document
//! finishes a phase before any document starts the next.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    Artifact, ArtifactId, ArtifactKind, BindingFailure, DocumentReport, DocumentStatus, Event,
    EventType, Fragment, RunReport,
};

use super::matcher::{self, Binding};
use super::operation::{
    Operation, OperationContext, OperationError, OperationRegistry, Output, Scope, Services,
};
use super::repository::{ArtifactQuery, Repository, RepositoryError};

/// Errors that stop a run
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Document task failed: {0}")]
    Task(String),
}

/// Run-level knobs
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stop starting new bindings after the first failure
    pub fail_fast: bool,

    /// Documents processed at the same time
    pub max_concurrent_documents: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_concurrent_documents: 1,
        }
    }
}

/// State shared by the document tasks of one run
struct RunContext {
    run_id: Uuid,
    registry: Arc<OperationRegistry>,
    repository: Arc<dyn Repository>,
    services: Arc<Services>,
    fail_fast: bool,
    aborted: AtomicBool,
}

impl RunContext {
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Executes a registry against a repository
pub struct Runner {
    registry: Arc<OperationRegistry>,
    repository: Arc<dyn Repository>,
    services: Arc<Services>,
    options: RunOptions,
}

impl Runner {
    pub fn new(registry: OperationRegistry, repository: Arc<dyn Repository>) -> Self {
        Self {
            registry: Arc::new(registry),
            repository,
            services: Arc::new(Services::new()),
            options: RunOptions::default(),
        }
    }

    pub fn with_services(mut self, services: Services) -> Self {
        self.services = Arc::new(services);
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    /// Process every document in the repository
    pub async fn run(&self) -> Result<RunReport, EngineError> {
        let documents = self
            .repository
            .query(&ArtifactQuery::kind(ArtifactKind::Document))
            .await?;
        self.execute(documents).await
    }

    /// Process only the given documents, in the given order
    pub async fn run_documents(&self, ids: &[ArtifactId]) -> Result<RunReport, EngineError> {
        let mut documents = Vec::with_capacity(ids.len());
        let mut seen = HashSet::new();
        for id in ids {
            if seen.insert(id.clone()) {
                documents.push(self.repository.get(id).await?);
            }
        }
        self.execute(documents).await
    }

    #[instrument(skip(self, documents), fields(documents = documents.len()))]
    async fn execute(&self, documents: Vec<Artifact>) -> Result<RunReport, EngineError> {
        let run_id = Uuid::new_v4();
        let mut report = RunReport::new(run_id);
        info!(%run_id, operations = self.registry.len(), "Starting run");

        self.repository
            .append_event(&Event::new(
                run_id,
                EventType::RunStarted,
                format!(
                    "Run started: {} documents, {} operations",
                    documents.len(),
                    self.registry.len()
                ),
            ))
            .await?;

        let ctx = Arc::new(RunContext {
            run_id,
            registry: Arc::clone(&self.registry),
            repository: Arc::clone(&self.repository),
            services: Arc::clone(&self.services),
            fail_fast: self.options.fail_fast,
            aborted: AtomicBool::new(false),
        });

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_documents.max(1)));
        let documents = Arc::new(documents);
        let mut reports: Vec<DocumentReport> = documents
            .iter()
            .map(|document| DocumentReport::new(document.id().clone()))
            .collect();
        let mut fatal: Option<EngineError> = None;

        let phases = phases(self.registry.operations());
        let last_phase = phases.len() - 1;

        for (number, operations) in phases.into_iter().enumerate() {
            let last = number == last_phase;
            let mut tasks = JoinSet::new();

            for (index, document_report) in std::mem::take(&mut reports).into_iter().enumerate() {
                let ctx = Arc::clone(&ctx);
                let semaphore = Arc::clone(&semaphore);
                let documents = Arc::clone(&documents);
                let operations = operations.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let document = &documents[index];
                    let result =
                        process_document(&ctx, document, operations, last, document_report).await;
                    (index, result)
                });
            }

            let mut results: Vec<(usize, DocumentReport)> = Vec::with_capacity(documents.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, Ok(document))) => results.push((index, document)),
                    Ok((_, Err(e))) => {
                        error!(%run_id, error = %e, "Run stopped by repository failure");
                        ctx.abort();
                        fatal.get_or_insert(e);
                    }
                    Err(e) => {
                        error!(%run_id, error = %e, "Document task did not finish");
                        ctx.abort();
                        fatal.get_or_insert(EngineError::Task(e.to_string()));
                    }
                }
            }

            results.sort_by_key(|(index, _)| *index);
            reports = results.into_iter().map(|(_, document)| document).collect();

            if fatal.is_some() || ctx.is_aborted() {
                break;
            }
        }

        report.documents = reports;
        report.aborted = ctx.is_aborted();
        report.finished_at = Some(chrono::Utc::now());

        if let Some(e) = fatal {
            // Best effort; the log itself may be what failed
            let _ = self
                .repository
                .append_event(
                    &Event::new(run_id, EventType::RunAborted, "Run aborted").with_error(e.to_string()),
                )
                .await;
            return Err(e);
        }

        let duration_ms = (report.finished_at.unwrap_or(report.started_at) - report.started_at)
            .num_milliseconds()
            .max(0) as u64;
        let summary = format!(
            "{} executed, {} skipped, {} failed",
            report.executed(),
            report.skipped(),
            report.failures().count()
        );

        if report.aborted {
            warn!(%run_id, %summary, "Run aborted after failure");
            self.repository
                .append_event(
                    &Event::new(run_id, EventType::RunAborted, summary).with_duration(duration_ms),
                )
                .await?;
        } else {
            info!(%run_id, %summary, "Run completed");
            self.repository
                .append_event(
                    &Event::new(run_id, EventType::RunCompleted, summary).with_duration(duration_ms),
                )
                .await?;
        }

        Ok(report)
    }
}

/// Registry ranges that every document completes before the next begins
fn phases(operations: &[Operation]) -> Vec<Range<usize>> {
    let mut phases = Vec::new();
    let mut start = 0;
    for (index, operation) in operations.iter().enumerate() {
        if operation.scope == Scope::All && index > start {
            phases.push(start..index);
            start = index;
        }
    }
    phases.push(start..operations.len());
    phases
}

/// Run one phase of the registry for `document`, finishing it on the last
#[instrument(skip_all, fields(run_id = %ctx.run_id, document = %document.id()))]
async fn process_document(
    ctx: &RunContext,
    document: &Artifact,
    operations: Range<usize>,
    last: bool,
    mut report: DocumentReport,
) -> Result<DocumentReport, EngineError> {
    if !ctx.is_aborted() {
        if report.status == DocumentStatus::Pending {
            report.status = DocumentStatus::Processing;
            ctx.repository
                .append_event(&Event::for_document(
                    ctx.run_id,
                    EventType::DocumentStarted,
                    document.id(),
                    format!("Processing {}", document),
                ))
                .await?;
        }

        'operations: for operation in &ctx.registry.operations()[operations] {
            let bindings = matcher::bindings(ctx.repository.as_ref(), operation, document).await?;

            for binding in bindings {
                if ctx.is_aborted() {
                    break 'operations;
                }

                let done = ctx
                    .repository
                    .has_output(&operation.name, document.id(), &operation.output.label, &binding.key)
                    .await?;
                if done {
                    debug!(operation = %operation.name, binding = %binding.key, "Binding already satisfied, skipping");
                    report.skipped += 1;
                    continue;
                }

                report.executed += 1;
                match execute_binding(ctx, operation, document, &binding).await? {
                    Ok(outputs) => report.produced.extend(outputs),
                    Err(e) => {
                        report.failures.push(BindingFailure {
                            operation: operation.name.clone(),
                            document: document.id().clone(),
                            binding_key: binding.key.clone(),
                            error: e.to_string(),
                        });
                        if ctx.fail_fast {
                            ctx.abort();
                        }
                    }
                }
            }
        }
    }

    if last || ctx.is_aborted() {
        finish_document(ctx, document, &mut report).await?;
    }
    Ok(report)
}

/// Settle the final status of a started document and log it
async fn finish_document(
    ctx: &RunContext,
    document: &Artifact,
    report: &mut DocumentReport,
) -> Result<(), EngineError> {
    if report.status != DocumentStatus::Processing {
        return Ok(());
    }

    let event_type = if !report.failures.is_empty() {
        report.status = DocumentStatus::Failed;
        EventType::DocumentFailed
    } else if ctx.is_aborted() {
        // Interrupted by another document's failure
        return Ok(());
    } else {
        report.status = DocumentStatus::Completed;
        EventType::DocumentCompleted
    };

    ctx.repository
        .append_event(&Event::for_document(
            ctx.run_id,
            event_type,
            document.id(),
            format!(
                "{} executed, {} skipped, {} failed",
                report.executed,
                report.skipped,
                report.failures.len()
            ),
        ))
        .await?;
    Ok(())
}

/// Invoke one binding and persist its outputs.
///
/// The outer error is fatal to the run; the inner one belongs to the binding.
#[instrument(skip_all, fields(operation = %operation.name, binding = %binding.key))]
async fn execute_binding(
    ctx: &RunContext,
    operation: &Operation,
    document: &Artifact,
    binding: &Binding,
) -> Result<Result<Vec<ArtifactId>, OperationError>, EngineError> {
    let start = Instant::now();
    let op_ctx = OperationContext::new(
        ctx.run_id,
        operation.name.clone(),
        document.id().clone(),
        Arc::clone(&ctx.services),
    );

    let outcome = match operation.invoke(&op_ctx, binding.arguments.clone()).await {
        Ok(result) => match operation.output.accept(result) {
            Ok(outputs) => store_outputs(ctx, operation, binding, outputs).await?,
            Err(e) => Err(e),
        },
        Err(e) => Err(OperationError::from(e)),
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    let event = match outcome {
        Ok(ref ids) => {
            info!(produced = ids.len(), duration_ms, "Binding completed");
            Event::for_binding(
                ctx.run_id,
                EventType::BindingCompleted,
                &operation.name,
                document.id(),
                &binding.key,
                &operation.output.label,
                format!("{} produced {} fragment(s)", operation.name, ids.len()),
            )
            .with_outputs(ids.clone())
        }
        Err(ref e) => {
            warn!(error = %e, duration_ms, "Binding failed");
            Event::for_binding(
                ctx.run_id,
                EventType::BindingFailed,
                &operation.name,
                document.id(),
                &binding.key,
                &operation.output.label,
                format!("{} failed", operation.name),
            )
            .with_error(e.to_string())
        }
    };
    ctx.repository
        .append_event(&event.with_duration(duration_ms))
        .await?;

    Ok(outcome)
}

async fn store_outputs(
    ctx: &RunContext,
    operation: &Operation,
    binding: &Binding,
    outputs: Vec<(u32, Output)>,
) -> Result<Result<Vec<ArtifactId>, OperationError>, EngineError> {
    let mut ids = Vec::with_capacity(outputs.len());

    for (ordinal, output) in outputs {
        let kind = output.kind.unwrap_or(operation.output.kind);
        let mut fragment = Fragment::derived_from(
            &binding.primary,
            kind,
            operation.output.label.clone(),
            binding.discriminator(),
            ordinal,
        );
        fragment.content = output.content;
        fragment.metadata = output.metadata;
        fragment.vector = output.vector;
        fragment.produced_by = Some(operation.name.clone());
        if let Some(mime_type) = output.mime_type {
            fragment.mime_type = mime_type;
        }

        let artifact: Artifact = fragment.into();
        match ctx.repository.put(artifact.clone()).await {
            Ok(id) => ids.push(id),
            Err(RepositoryError::DuplicateArtifact(id)) => {
                if !is_own_output(ctx, operation, &id).await? {
                    return Ok(Err(OperationError::Conflict(id)));
                }
                // An earlier attempt of this operation stored other data here
                warn!(%id, "Superseding output of an earlier attempt");
                ctx.repository.delete(&id).await?;
                ids.push(ctx.repository.put(artifact).await?);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Ok(ids))
}

async fn is_own_output(
    ctx: &RunContext,
    operation: &Operation,
    id: &ArtifactId,
) -> Result<bool, RepositoryError> {
    let stored = ctx.repository.get(id).await?;
    Ok(stored
        .as_fragment()
        .and_then(|fragment| fragment.produced_by.as_deref())
        == Some(operation.name.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::{OutputSpec, ParamSpec};
    use crate::core::repository::LocalRepository;
    use crate::domain::{Document, EventFilter};
    use anyhow::anyhow;
    use tempfile::TempDir;

    async fn setup() -> (Arc<LocalRepository>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let repo = Arc::new(LocalRepository::open(temp_dir.path()).await.unwrap());
        (repo, temp_dir)
    }

    fn upper() -> Operation {
        Operation::builder("upper")
            .input(ParamSpec::one("doc", ArtifactKind::Document))
            .output(OutputSpec::one(ArtifactKind::Text, "upper"))
            .handler(|_, args| {
                let doc = args.one(0)?;
                Ok(Output::default().with_text(doc.content_as_str().to_uppercase()).into())
            })
            .build()
            .unwrap()
    }

    fn scoped(name: &str, scope: Scope) -> Operation {
        Operation::builder(name)
            .input(ParamSpec::one("doc", ArtifactKind::Document))
            .output(OutputSpec::one(ArtifactKind::Text, name))
            .scope(scope)
            .handler(|_, _| Ok(Output::default().into()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_phases_split_before_global_operations() {
        let operations = vec![
            scoped("a", Scope::Document),
            scoped("b", Scope::Document),
            scoped("c", Scope::All),
            scoped("d", Scope::Document),
        ];
        assert_eq!(phases(&operations), vec![0..2, 2..4]);

        // A leading global operation opens no empty phase
        let operations = vec![scoped("a", Scope::All), scoped("b", Scope::All)];
        assert_eq!(phases(&operations), vec![0..1, 1..2]);

        assert_eq!(phases(&[]), vec![0..0]);
    }

    #[tokio::test]
    async fn test_run_produces_fragment() {
        let (repo, _temp) = setup().await;
        let doc: Artifact = Document::new("doc", b"hello".to_vec(), "text/plain").into();
        repo.put(doc.clone()).await.unwrap();

        let mut registry = OperationRegistry::new();
        registry.register(upper()).unwrap();
        let runner = Runner::new(registry, repo.clone());

        let report = runner.run().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.executed(), 1);

        let produced = &report.documents[0].produced;
        assert_eq!(produced.len(), 1);
        let fragment = repo.get(&produced[0]).await.unwrap();
        assert_eq!(fragment.content(), b"HELLO");
        assert_eq!(fragment.source(), Some(doc.id()));
        assert_eq!(fragment.label(), Some("upper"));
        assert_eq!(fragment.mime_type(), "text/plain");
        assert_eq!(
            fragment.as_fragment().unwrap().produced_by.as_deref(),
            Some("upper")
        );
    }

    #[tokio::test]
    async fn test_non_compliant_result_is_binding_failure() {
        let (repo, _temp) = setup().await;
        repo.put(Document::new("doc", b"hello".to_vec(), "text/plain").into())
            .await
            .unwrap();

        let op = Operation::builder("wrong")
            .input(ParamSpec::one("doc", ArtifactKind::Document))
            .output(OutputSpec::one(ArtifactKind::Text, "text"))
            .handler(|_, _| Ok(vec![Output::new(ArtifactKind::Text)].into()))
            .build()
            .unwrap();
        let mut registry = OperationRegistry::new();
        registry.register(op).unwrap();

        let report = Runner::new(registry, repo.clone()).run().await.unwrap();
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.contains("Non-compliant"));
        assert_eq!(report.documents[0].status, DocumentStatus::Failed);
        assert_eq!(repo.len().await, 1);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts_run() {
        let (repo, _temp) = setup().await;
        for content in ["one", "two", "three"] {
            repo.put(Document::new(content, content.as_bytes().to_vec(), "text/plain").into())
                .await
                .unwrap();
        }

        let failing = Operation::builder("failing")
            .input(ParamSpec::one("doc", ArtifactKind::Document))
            .output(OutputSpec::one(ArtifactKind::Text, "text"))
            .handler(|_, _| Err(anyhow!("service unavailable")))
            .build()
            .unwrap();
        let mut registry = OperationRegistry::new();
        registry.register(failing).unwrap();

        let runner = Runner::new(registry, repo.clone()).with_options(RunOptions {
            fail_fast: true,
            max_concurrent_documents: 1,
        });
        let report = runner.run().await.unwrap();

        assert!(report.aborted);
        assert_eq!(report.failures().count(), 1);
        assert_eq!(report.documents.len(), 3);
        assert_eq!(report.documents[1].status, DocumentStatus::Pending);

        let aborted = repo
            .events(&EventFilter {
                run_id: Some(report.run_id),
                event_type: Some(EventType::RunAborted),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(aborted.len(), 1);
    }

    #[tokio::test]
    async fn test_run_events_are_logged() {
        let (repo, _temp) = setup().await;
        repo.put(Document::new("doc", b"hello".to_vec(), "text/plain").into())
            .await
            .unwrap();

        let mut registry = OperationRegistry::new();
        registry.register(upper()).unwrap();
        let report = Runner::new(registry, repo.clone()).run().await.unwrap();

        let events = repo
            .events(&EventFilter {
                run_id: Some(report.run_id),
                ..Default::default()
            })
            .await
            .unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                EventType::RunStarted,
                EventType::DocumentStarted,
                EventType::BindingCompleted,
                EventType::DocumentCompleted,
                EventType::RunCompleted,
            ]
        );
        assert_eq!(events[2].outputs, report.documents[0].produced);
    }

    #[tokio::test]
    async fn test_run_documents_selects_subset() {
        let (repo, _temp) = setup().await;
        let first = repo
            .put(Document::new("a", b"a".to_vec(), "text/plain").into())
            .await
            .unwrap();
        repo.put(Document::new("b", b"b".to_vec(), "text/plain").into())
            .await
            .unwrap();

        let mut registry = OperationRegistry::new();
        registry.register(upper()).unwrap();
        let report = Runner::new(registry, repo.clone())
            .run_documents(&[first.clone(), first.clone()])
            .await
            .unwrap();

        assert_eq!(report.documents.len(), 1);
        assert_eq!(report.documents[0].document, first);
    }

    #[tokio::test]
    async fn test_concurrent_documents() {
        let (repo, _temp) = setup().await;
        for i in 0..8 {
            let content = format!("document {}", i);
            repo.put(Document::new(content.clone(), content.into_bytes(), "text/plain").into())
                .await
                .unwrap();
        }

        let mut registry = OperationRegistry::new();
        registry.register(upper()).unwrap();
        let runner = Runner::new(registry, repo.clone()).with_options(RunOptions {
            fail_fast: false,
            max_concurrent_documents: 4,
        });

        let report = runner.run().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.executed(), 8);

        // Report keeps document insertion order
        let documents = repo
            .query(&ArtifactQuery::kind(ArtifactKind::Document))
            .await
            .unwrap();
        let expected: Vec<_> = documents.iter().map(|d| d.id().clone()).collect();
        let actual: Vec<_> = report.documents.iter().map(|d| d.document.clone()).collect();
        assert_eq!(actual, expected);
    }

    #[tokio::test]
    async fn test_services_reach_operation_body() {
        struct Prefix(&'static str);

        let (repo, _temp) = setup().await;
        repo.put(Document::new("doc", b"hello".to_vec(), "text/plain").into())
            .await
            .unwrap();

        let op = Operation::builder("prefixed")
            .input(ParamSpec::one("doc", ArtifactKind::Document))
            .output(OutputSpec::one(ArtifactKind::Text, "prefixed"))
            .handler(|ctx, args| {
                let prefix = ctx.services().require::<Prefix>()?;
                let doc = args.one(0)?;
                Ok(Output::default()
                    .with_text(format!("{}{}", prefix.0, doc.content_as_str()))
                    .into())
            })
            .build()
            .unwrap();
        let mut registry = OperationRegistry::new();
        registry.register(op).unwrap();

        let report = Runner::new(registry, repo.clone())
            .with_services(Services::new().with(Prefix(">> ")))
            .run()
            .await
            .unwrap();

        let fragment = repo.get(&report.documents[0].produced[0]).await.unwrap();
        assert_eq!(fragment.content_as_str(), ">> hello");
    }
}
