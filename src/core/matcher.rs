//! Binding computation.
//!
//! For one operation and one document the matcher turns the declared
//! parameters into zero or more concrete [`Binding`]s against the artifacts
//! stored so far. `One` parameters fan out as a cartesian product in
//! declaration order; `Many` parameters receive the full pool.

use tracing::debug;

use crate::domain::artifact::hash_parts;
use crate::domain::{Artifact, ArtifactKind};

use super::operation::{Argument, Arguments, Multiplicity, Operation, ParamSpec, Scope};
use super::repository::{ArtifactQuery, Repository, RepositoryError};

/// Marker hashed in place of an absent optional argument
const ABSENT: &[u8] = b"-";

/// Marker preceding the ids of cross-document pools in a binding key
const POOL: &[u8] = b"pool";

/// One concrete invocation of an operation
#[derive(Debug, Clone)]
pub struct Binding {
    pub arguments: Arguments,

    /// Source of every fragment this binding produces
    pub primary: Artifact,

    /// Stable key identifying this binding within its document
    pub key: String,

    /// Number of `One` parameters bound to an artifact
    bound: usize,
}

impl Binding {
    /// Extra identity component for fragments derived from this binding.
    ///
    /// Empty when the primary input alone identifies the binding.
    pub fn discriminator(&self) -> &str {
        if self.bound > 1 {
            &self.key
        } else {
            ""
        }
    }
}

enum Pool {
    One(Vec<Argument>),
    Many(Vec<Artifact>),
}

fn param_query(param: &ParamSpec, scope: Scope, document: &Artifact) -> ArtifactQuery {
    let query = ArtifactQuery::kind(param.kind).with_optional_label(param.label.as_deref());
    if param.multiplicity == Multiplicity::Many && scope == Scope::All {
        query
    } else {
        query.in_document(document.id())
    }
}

/// Compute every binding of `operation` for `document`, in a deterministic
/// order. An empty result means the operation does not fire.
pub async fn bindings(
    repository: &dyn Repository,
    operation: &Operation,
    document: &Artifact,
) -> Result<Vec<Binding>, RepositoryError> {
    let mut pools = Vec::with_capacity(operation.inputs.len());

    for param in &operation.inputs {
        let query = param_query(param, operation.scope, document);
        let candidates = if query.kind == Some(ArtifactKind::Document)
            && query.label.is_none()
            && query.document.is_some()
        {
            vec![document.clone()]
        } else {
            repository.query(&query).await?
        };

        if candidates.is_empty() && !param.optional {
            debug!(
                operation = %operation.name,
                document = %document.id(),
                param = %param.name,
                "No candidates, operation does not fire"
            );
            return Ok(Vec::new());
        }

        pools.push(match param.multiplicity {
            Multiplicity::Many => Pool::Many(candidates),
            Multiplicity::One if candidates.is_empty() => Pool::One(vec![Argument::Absent]),
            Multiplicity::One => Pool::One(candidates.into_iter().map(Argument::One).collect()),
        });
    }

    // Cartesian product over One pools; the first parameter varies slowest
    let mut combinations: Vec<Vec<Argument>> = vec![Vec::new()];
    for pool in &pools {
        combinations = match pool {
            Pool::Many(artifacts) => combinations
                .into_iter()
                .map(|mut args| {
                    args.push(Argument::Many(artifacts.clone()));
                    args
                })
                .collect(),
            Pool::One(choices) => combinations
                .into_iter()
                .flat_map(|args| {
                    choices.iter().map(move |choice| {
                        let mut next = args.clone();
                        next.push(choice.clone());
                        next
                    })
                })
                .collect(),
        };
    }

    let bindings: Vec<Binding> = combinations
        .into_iter()
        .map(|args| bind(document, args, operation.scope))
        .collect();

    debug!(
        operation = %operation.name,
        document = %document.id(),
        bindings = bindings.len(),
        "Computed bindings"
    );
    Ok(bindings)
}

fn bind(document: &Artifact, args: Vec<Argument>, scope: Scope) -> Binding {
    let mut primary = None;
    let mut bound = 0;
    let mut parts: Vec<&[u8]> = vec![b"binding".as_slice()];
    let mut pooled: Vec<&[u8]> = Vec::new();

    for arg in &args {
        match arg {
            Argument::One(artifact) => {
                bound += 1;
                primary.get_or_insert(artifact);
                parts.push(artifact.id().as_str().as_bytes());
            }
            Argument::Absent => parts.push(ABSENT),
            // Pools spanning other documents grow independently of this one
            Argument::Many(artifacts) if scope == Scope::All => {
                pooled.extend(artifacts.iter().map(|a| a.id().as_str().as_bytes()));
            }
            Argument::Many(_) => {}
        }
    }

    if bound == 0 {
        parts = vec![b"binding".as_slice(), document.id().as_str().as_bytes()];
    }
    if !pooled.is_empty() {
        parts.push(POOL);
        parts.extend(pooled);
    }

    let key = hash_parts(&parts);
    let primary = primary.unwrap_or(document).clone();

    Binding {
        arguments: Arguments::new(args),
        primary,
        key,
        bound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operation::{Output, OutputSpec};
    use crate::core::repository::LocalRepository;
    use crate::domain::{Document, Fragment};
    use tempfile::TempDir;

    fn operation(inputs: Vec<ParamSpec>, scope: Scope) -> Operation {
        let mut builder = Operation::builder("op")
            .output(OutputSpec::one(ArtifactKind::Summary, "out"))
            .scope(scope)
            .handler(|_, _| Ok(Output::new(ArtifactKind::Summary).into()));
        for input in inputs {
            builder = builder.input(input);
        }
        builder.build().unwrap()
    }

    async fn fragment(
        repo: &LocalRepository,
        source: &Artifact,
        kind: ArtifactKind,
        label: &str,
        ordinal: u32,
    ) -> Artifact {
        let artifact: Artifact = Fragment::derived_from(source, kind, label, "", ordinal).into();
        repo.put(artifact.clone()).await.unwrap();
        artifact
    }

    async fn document(repo: &LocalRepository, content: &str) -> Artifact {
        let doc: Artifact = Document::new("doc", content.as_bytes().to_vec(), "text/plain").into();
        repo.put(doc.clone()).await.unwrap();
        doc
    }

    #[tokio::test]
    async fn test_document_param_binds_document() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let doc = document(&repo, "hello").await;

        let op = operation(vec![ParamSpec::one("doc", ArtifactKind::Document)], Scope::Document);
        let bindings = bindings(&repo, &op, &doc).await.unwrap();

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].primary.id(), doc.id());
        assert_eq!(bindings[0].discriminator(), "");
    }

    #[tokio::test]
    async fn test_one_params_cartesian_product() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let doc = document(&repo, "hello").await;
        let a1 = fragment(&repo, &doc, ArtifactKind::Text, "a", 1).await;
        let a2 = fragment(&repo, &doc, ArtifactKind::Text, "a", 2).await;
        let b1 = fragment(&repo, &doc, ArtifactKind::Image, "b", 1).await;
        let b2 = fragment(&repo, &doc, ArtifactKind::Image, "b", 2).await;
        let b3 = fragment(&repo, &doc, ArtifactKind::Image, "b", 3).await;

        let op = operation(
            vec![
                ParamSpec::one("text", ArtifactKind::Text),
                ParamSpec::one("image", ArtifactKind::Image),
            ],
            Scope::Document,
        );
        let bindings = bindings(&repo, &op, &doc).await.unwrap();
        assert_eq!(bindings.len(), 6);

        let pairs: Vec<_> = bindings
            .iter()
            .map(|b| {
                (
                    b.arguments.one(0).unwrap().id().clone(),
                    b.arguments.one(1).unwrap().id().clone(),
                )
            })
            .collect();
        let expected: Vec<_> = [&a1, &a2]
            .iter()
            .flat_map(|a| [&b1, &b2, &b3].map(|b| (a.id().clone(), b.id().clone())))
            .collect();
        assert_eq!(pairs, expected);

        // Every binding has its own key, discriminated beyond the primary
        let mut keys: Vec<_> = bindings.iter().map(|b| b.key.clone()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), 6);
        assert_eq!(bindings[0].primary.id(), a1.id());
        assert_eq!(bindings[0].discriminator(), bindings[0].key);
    }

    #[tokio::test]
    async fn test_many_param_gets_full_pool() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let doc = document(&repo, "hello").await;
        for i in 1..=3 {
            fragment(&repo, &doc, ArtifactKind::Markdown, "section", i).await;
        }

        let op = operation(
            vec![ParamSpec::many("sections", ArtifactKind::Markdown).with_label("section")],
            Scope::Document,
        );
        let bindings = bindings(&repo, &op, &doc).await.unwrap();

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].arguments.many(0).unwrap().len(), 3);
        assert_eq!(bindings[0].primary.id(), doc.id());
    }

    #[tokio::test]
    async fn test_empty_required_pool_does_not_fire() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let doc = document(&repo, "hello").await;

        let op = operation(vec![ParamSpec::one("text", ArtifactKind::Text)], Scope::Document);
        assert!(bindings(&repo, &op, &doc).await.unwrap().is_empty());

        let op = operation(vec![ParamSpec::many("texts", ArtifactKind::Text)], Scope::Document);
        assert!(bindings(&repo, &op, &doc).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optional_params_bind_empty() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let doc = document(&repo, "hello").await;

        let op = operation(
            vec![
                ParamSpec::one("doc", ArtifactKind::Document),
                ParamSpec::one("figure", ArtifactKind::Figure).optional(),
                ParamSpec::many("images", ArtifactKind::Image).optional(),
            ],
            Scope::Document,
        );
        let bindings = bindings(&repo, &op, &doc).await.unwrap();

        assert_eq!(bindings.len(), 1);
        assert!(bindings[0].arguments.optional(1).is_none());
        assert!(bindings[0].arguments.many(2).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_label_filters_candidates() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let doc = document(&repo, "hello").await;
        let wanted = fragment(&repo, &doc, ArtifactKind::Text, "text", 0).await;
        fragment(&repo, &doc, ArtifactKind::Text, "ocr", 0).await;

        let op = operation(
            vec![ParamSpec::one("text", ArtifactKind::Text).with_label("text")],
            Scope::Document,
        );
        let bindings = bindings(&repo, &op, &doc).await.unwrap();

        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].primary.id(), wanted.id());
    }

    #[tokio::test]
    async fn test_scope_controls_many_pools() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let first = document(&repo, "first").await;
        let second = document(&repo, "second").await;
        fragment(&repo, &first, ArtifactKind::Summary, "summary", 0).await;
        fragment(&repo, &second, ArtifactKind::Summary, "summary", 0).await;

        let inputs = vec![
            ParamSpec::one("doc", ArtifactKind::Document),
            ParamSpec::many("summaries", ArtifactKind::Summary),
        ];

        let local = operation(inputs.clone(), Scope::Document);
        let bindings_local = bindings(&repo, &local, &first).await.unwrap();
        assert_eq!(bindings_local[0].arguments.many(1).unwrap().len(), 1);

        let global = operation(inputs, Scope::All);
        let bindings_global = bindings(&repo, &global, &first).await.unwrap();
        assert_eq!(bindings_global[0].arguments.many(1).unwrap().len(), 2);

        // One params stay per document regardless of scope
        assert_eq!(bindings_global[0].arguments.one(0).unwrap().id(), first.id());

        // The cross-document pool is part of the key, the local one is not
        assert_ne!(bindings_local[0].key, bindings_global[0].key);
        fragment(&repo, &first, ArtifactKind::Summary, "summary", 1).await;
        let grown_local = bindings(&repo, &local, &first).await.unwrap();
        let grown_global = bindings(&repo, &global, &first).await.unwrap();
        assert_eq!(grown_local[0].key, bindings_local[0].key);
        assert_ne!(grown_global[0].key, bindings_global[0].key);
    }

    #[tokio::test]
    async fn test_keys_are_stable_between_calls() {
        let dir = TempDir::new().unwrap();
        let repo = LocalRepository::open(dir.path()).await.unwrap();
        let doc = document(&repo, "hello").await;
        fragment(&repo, &doc, ArtifactKind::Text, "text", 0).await;

        let op = operation(vec![ParamSpec::one("text", ArtifactKind::Text)], Scope::Document);
        let first: Vec<_> = bindings(&repo, &op, &doc).await.unwrap().into_iter().map(|b| b.key).collect();
        let again: Vec<_> = bindings(&repo, &op, &doc).await.unwrap().into_iter().map(|b| b.key).collect();
        assert_eq!(first, again);
    }
}
