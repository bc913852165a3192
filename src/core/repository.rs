//! Durable, resumable artifact storage.
//!
//! [`LocalRepository`] keeps one directory per document and one record per
//! fragment, plus two append-only JSONL logs:
//!
//! ```text
//! <root>/
//! ├── .lock                      # held exclusively while the repository is open
//! ├── index.jsonl                # put/delete log, defines insertion order
//! ├── operations.jsonl           # operations log (binding outcomes)
//! └── documents/<document_id>/
//!     ├── document.json
//!     ├── document.content
//!     └── <label>/
//!         ├── <fragment_id>.json
//!         └── <fragment_id>.content
//! ```
//!
//! A put writes the content blob and the record first and appends the index
//! line last, so a record without an index line is invisible after re-open.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::{Artifact, ArtifactId, ArtifactKind, Event, EventFilter};

const INDEX_FILE: &str = "index.jsonl";
const OPERATIONS_FILE: &str = "operations.jsonl";
const LOCK_FILE: &str = ".lock";
const DOCUMENTS_DIR: &str = "documents";

/// Errors raised by a repository
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Artifact not found: {0}")]
    NotFound(ArtifactId),

    #[error("Artifact {0} already exists with different content")]
    DuplicateArtifact(ArtifactId),

    #[error("Fragment {fragment} references unknown source {parent}")]
    MissingSource {
        fragment: ArtifactId,
        parent: ArtifactId,
    },

    #[error("Repository at {0} is already open in another process")]
    Locked(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Selection of artifacts by kind, label and root document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactQuery {
    pub kind: Option<ArtifactKind>,
    pub label: Option<String>,
    pub document: Option<ArtifactId>,
}

impl ArtifactQuery {
    /// Everything in the repository
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: ArtifactKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_optional_label(mut self, label: Option<&str>) -> Self {
        self.label = label.map(str::to_string);
        self
    }

    pub fn in_document(mut self, document: &ArtifactId) -> Self {
        self.document = Some(document.clone());
        self
    }

    pub fn matches(&self, entry: &IndexEntry) -> bool {
        self.kind.map_or(true, |k| entry.kind == k)
            && self
                .label
                .as_deref()
                .map_or(true, |l| entry.label.as_deref() == Some(l))
            && self.document.as_ref().map_or(true, |d| &entry.document == d)
    }
}

/// Storage contract used by the engine
#[async_trait]
pub trait Repository: Send + Sync {
    /// Persist an artifact; idempotent for byte-identical content
    async fn put(&self, artifact: Artifact) -> Result<ArtifactId, RepositoryError>;

    async fn get(&self, id: &ArtifactId) -> Result<Artifact, RepositoryError>;

    /// Matching artifacts in insertion order
    async fn query(&self, query: &ArtifactQuery) -> Result<Vec<Artifact>, RepositoryError>;

    /// Remove a single artifact; fragments derived from it are kept
    async fn delete(&self, id: &ArtifactId) -> Result<Artifact, RepositoryError>;

    /// True if `operation` already completed `binding_key` for `document`
    /// and its outputs were not all deleted since.
    async fn has_output(
        &self,
        operation: &str,
        document: &ArtifactId,
        label: &str,
        binding_key: &str,
    ) -> Result<bool, RepositoryError>;

    async fn append_event(&self, event: &Event) -> Result<(), RepositoryError>;

    async fn events(&self, filter: &EventFilter) -> Result<Vec<Event>, RepositoryError>;
}

/// One committed artifact, as recorded in the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub seq: u64,
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub document: ArtifactId,

    /// Record path relative to the repository root
    pub record: PathBuf,
}

impl IndexEntry {
    fn content_path(&self) -> PathBuf {
        self.record.with_extension("content")
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum IndexLine {
    Put(IndexEntry),
    Delete { id: ArtifactId },
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    entries: BTreeMap<u64, IndexEntry>,
    by_id: HashMap<ArtifactId, u64>,
    events: Vec<Event>,
}

impl State {
    fn apply(&mut self, line: IndexLine) {
        match line {
            IndexLine::Put(entry) => {
                self.next_seq = self.next_seq.max(entry.seq + 1);
                if let Some(old) = self.by_id.insert(entry.id.clone(), entry.seq) {
                    self.entries.remove(&old);
                }
                self.entries.insert(entry.seq, entry);
            }
            IndexLine::Delete { id } => {
                if let Some(seq) = self.by_id.remove(&id) {
                    self.entries.remove(&seq);
                }
            }
        }
    }

    fn entry(&self, id: &ArtifactId) -> Option<&IndexEntry> {
        self.by_id.get(id).and_then(|seq| self.entries.get(seq))
    }
}

/// File-system repository
pub struct LocalRepository {
    root: PathBuf,
    state: Mutex<State>,

    /// Held for the lifetime of the repository
    _lock: std::fs::File,
}

impl LocalRepository {
    /// Open (or create) a repository rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(DOCUMENTS_DIR)).await?;

        let lock = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(root.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| RepositoryError::Locked(root.clone()))?;

        let mut state = State::default();
        for line in read_jsonl::<IndexLine>(&root.join(INDEX_FILE)).await? {
            state.apply(line);
        }
        state.events = read_jsonl::<Event>(&root.join(OPERATIONS_FILE)).await?;

        debug!(
            root = %root.display(),
            artifacts = state.entries.len(),
            events = state.events.len(),
            "Opened repository"
        );

        Ok(Self {
            root,
            state: Mutex::new(state),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Index entries matching `query`, without loading content
    pub async fn entries(&self, query: &ArtifactQuery) -> Vec<IndexEntry> {
        let state = self.state.lock().await;
        state
            .entries
            .values()
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    /// Number of committed artifacts
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn record_path(artifact: &Artifact) -> PathBuf {
        let document_dir = PathBuf::from(DOCUMENTS_DIR).join(artifact.document_id().as_str());
        match artifact {
            Artifact::Document(_) => document_dir.join("document.json"),
            Artifact::Fragment(f) => document_dir
                .join(sanitize_label(&f.label))
                .join(format!("{}.json", f.id)),
        }
    }

    async fn load(&self, entry: &IndexEntry) -> Result<Artifact, RepositoryError> {
        let record = fs::read_to_string(self.root.join(&entry.record)).await?;
        let mut artifact: Artifact = serde_json::from_str(&record)?;

        match fs::read(self.root.join(entry.content_path())).await {
            Ok(content) => artifact.set_content(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(artifact)
    }

    async fn append_line<T: Serialize>(&self, file: &str, value: &T) -> Result<(), RepositoryError> {
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(file))
            .await?;

        let json = serde_json::to_string(value)?;
        handle.write_all(format!("{}\n", json).as_bytes()).await?;
        handle.flush().await?;
        handle.sync_data().await?;

        Ok(())
    }
}

impl std::fmt::Debug for LocalRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRepository")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Repository for LocalRepository {
    async fn put(&self, artifact: Artifact) -> Result<ArtifactId, RepositoryError> {
        let mut state = self.state.lock().await;
        let id = artifact.id().clone();

        if let Some(entry) = state.entry(&id).cloned() {
            let existing = self.load(&entry).await?;
            if existing.same_content(&artifact) {
                debug!(%id, "Artifact already stored with identical content");
                return Ok(id);
            }
            return Err(RepositoryError::DuplicateArtifact(id));
        }

        if let Some(parent) = artifact.source() {
            if state.entry(parent).is_none() {
                return Err(RepositoryError::MissingSource {
                    fragment: id,
                    parent: parent.clone(),
                });
            }
        }

        let record = Self::record_path(&artifact);
        let entry = IndexEntry {
            seq: state.next_seq,
            id: id.clone(),
            kind: artifact.kind(),
            label: artifact.label().map(str::to_string),
            document: artifact.document_id().clone(),
            record: record.clone(),
        };

        let record_path = self.root.join(&record);
        if let Some(parent) = record_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        write_atomic(self.root.join(entry.content_path()), artifact.content().to_vec()).await?;
        write_atomic(record_path, serde_json::to_vec_pretty(&artifact)?).await?;

        let line = IndexLine::Put(entry);
        self.append_line(INDEX_FILE, &line).await?;
        state.apply(line);

        debug!(%id, kind = %artifact.kind(), label = ?artifact.label(), "Stored artifact");
        Ok(id)
    }

    async fn get(&self, id: &ArtifactId) -> Result<Artifact, RepositoryError> {
        let entry = {
            let state = self.state.lock().await;
            state
                .entry(id)
                .cloned()
                .ok_or_else(|| RepositoryError::NotFound(id.clone()))?
        };
        self.load(&entry).await
    }

    async fn query(&self, query: &ArtifactQuery) -> Result<Vec<Artifact>, RepositoryError> {
        let entries = self.entries(query).await;
        let mut artifacts = Vec::with_capacity(entries.len());
        for entry in &entries {
            artifacts.push(self.load(entry).await?);
        }
        Ok(artifacts)
    }

    async fn delete(&self, id: &ArtifactId) -> Result<Artifact, RepositoryError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entry(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        let artifact = self.load(&entry).await?;

        let line = IndexLine::Delete { id: id.clone() };
        self.append_line(INDEX_FILE, &line).await?;
        state.apply(line);

        for path in [entry.record.clone(), entry.content_path()] {
            match fs::remove_file(self.root.join(&path)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact file"),
            }
        }

        debug!(%id, "Deleted artifact");
        Ok(artifact)
    }

    async fn has_output(
        &self,
        operation: &str,
        document: &ArtifactId,
        label: &str,
        binding_key: &str,
    ) -> Result<bool, RepositoryError> {
        let state = self.state.lock().await;
        let completion = state
            .events
            .iter()
            .rev()
            .find(|e| e.completes(operation, document, label, binding_key));

        Ok(match completion {
            None => false,
            Some(event) if event.outputs.is_empty() => true,
            Some(event) => event.outputs.iter().any(|id| state.by_id.contains_key(id)),
        })
    }

    async fn append_event(&self, event: &Event) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        self.append_line(OPERATIONS_FILE, event).await?;
        state.events.push(event.clone());
        Ok(())
    }

    async fn events(&self, filter: &EventFilter) -> Result<Vec<Event>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.events.iter().filter(|e| filter.matches(e)).cloned().collect())
    }
}

/// Write through a temp file in the target directory, then rename into place
async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> Result<(), RepositoryError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        use std::io::Write as _;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&bytes)?;
        file.as_file().sync_data()?;
        file.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(())
}

/// Replay a JSONL file, skipping lines that do not parse (torn writes)
async fn read_jsonl<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, RepositoryError> {
    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut items = Vec::new();
    for (number, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(item) => items.push(item),
            Err(e) => warn!(
                path = %path.display(),
                line = number + 1,
                error = %e,
                "Skipping unreadable log line"
            ),
        }
    }

    if !content.is_empty() && !content.ends_with('\n') {
        // Terminate a torn last line so the next append starts cleanly
        let mut file = OpenOptions::new().append(true).open(path).await?;
        file.write_all(b"\n").await?;
    }

    Ok(items)
}

/// Make a label safe to use as a directory name
fn sanitize_label(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // "", "." and ".." are not usable as directory names
    if sanitized.chars().all(|c| c == '.') {
        format!("_{}", sanitized)
    } else {
        sanitized
    }
}
