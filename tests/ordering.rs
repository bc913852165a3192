//! Registration Order Integration Tests
//!
//! Operations run in the order they were registered. A consumer listed
//! before its producer sees nothing on the first run and catches up on the
//! next one.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use catalyst::core::{
    ArtifactQuery, LocalRepository, Operation, OperationRegistry, Output, OutputSpec, ParamSpec,
    Repository, Runner,
};
use catalyst::domain::{ArtifactKind, Document};
use tempfile::TempDir;

fn backwards_registry(produced: Arc<AtomicUsize>, consumed: Arc<AtomicUsize>) -> OperationRegistry {
    let mut registry = OperationRegistry::new();
    registry
        .register(
            Operation::builder("tag")
                .input(ParamSpec::one("text", ArtifactKind::Text).with_label("text"))
                .output(OutputSpec::one(ArtifactKind::Generic, "tags"))
                .handler(move |_, args| {
                    consumed.fetch_add(1, Ordering::SeqCst);
                    let tags = args.one(0)?.content_as_str().to_lowercase();
                    Ok(Output::default().with_text(tags).into())
                })
                .build()
                .unwrap(),
        )
        .unwrap()
        .register(
            Operation::builder("extract")
                .input(ParamSpec::one("doc", ArtifactKind::Document))
                .output(OutputSpec::one(ArtifactKind::Text, "text"))
                .handler(move |_, args| {
                    produced.fetch_add(1, Ordering::SeqCst);
                    Ok(Output::default().with_text(args.one(0)?.content_as_str()).into())
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_consumer_before_producer_catches_up_next_run() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Arc::new(LocalRepository::open(temp_dir.path()).await.unwrap());
    repo.put(Document::new("doc", b"Rust Tokio".to_vec(), "text/plain").into())
        .await
        .unwrap();

    let produced = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));
    let runner = Runner::new(
        backwards_registry(Arc::clone(&produced), Arc::clone(&consumed)),
        repo.clone(),
    );

    let first = runner.run().await.unwrap();
    assert!(first.is_success());
    assert_eq!(first.executed(), 1);
    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert_eq!(consumed.load(Ordering::SeqCst), 0);

    let second = runner.run().await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.executed(), 1);
    assert_eq!(second.skipped(), 1);
    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert_eq!(consumed.load(Ordering::SeqCst), 1);

    let tags = repo
        .query(&ArtifactQuery::kind(ArtifactKind::Generic))
        .await
        .unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].content_as_str(), "rust tokio");

    let third = runner.run().await.unwrap();
    assert_eq!(third.executed(), 0);
    assert_eq!(third.skipped(), 2);
}

#[tokio::test]
async fn test_producer_first_completes_in_one_run() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Arc::new(LocalRepository::open(temp_dir.path()).await.unwrap());
    repo.put(Document::new("doc", b"Ordered".to_vec(), "text/plain").into())
        .await
        .unwrap();

    let produced = Arc::new(AtomicUsize::new(0));
    let consumed = Arc::new(AtomicUsize::new(0));
    let backwards = backwards_registry(Arc::clone(&produced), Arc::clone(&consumed));

    // Same operations, producer first
    let mut forwards = OperationRegistry::new();
    forwards
        .register(backwards.get("extract").unwrap().clone())
        .unwrap()
        .register(backwards.get("tag").unwrap().clone())
        .unwrap();

    let report = Runner::new(forwards, repo.clone()).run().await.unwrap();
    assert_eq!(report.executed(), 2);
    assert_eq!(produced.load(Ordering::SeqCst), 1);
    assert_eq!(consumed.load(Ordering::SeqCst), 1);
}
