//! Artifacts flowing through a pipeline.
//!
//! An artifact is either a [`Document`] (a top-level input) or a
//! [`Fragment`] derived from another artifact by an operation. Both are
//! immutable once stored. Content bytes are never serialized with the
//! record; the repository keeps them in a separate blob.

use std::borrow::Cow;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

/// Free-form metadata attached to an artifact
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Separator used when hashing identity components
const ID_SEPARATOR: u8 = 0x1f;

/// Stable artifact identity (32 hex chars of a SHA-256 digest)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(String);

impl ArtifactId {
    /// Wrap an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identity of a document derived from its content bytes
    pub fn from_content(content: &[u8]) -> Self {
        Self(hash_parts(&[b"document", content]))
    }

    /// Identity of a fragment derived from its source chain.
    ///
    /// `binding` distinguishes invocations that share a source but were
    /// bound to different secondary inputs; it is empty for the common
    /// single-input case.
    pub fn derive(source: &ArtifactId, label: &str, binding: &str, ordinal: u32) -> Self {
        let ordinal = ordinal.to_string();
        Self(hash_parts(&[
            source.0.as_bytes(),
            label.as_bytes(),
            binding.as_bytes(),
            ordinal.as_bytes(),
        ]))
    }

    /// Get the raw string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ArtifactId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Hash a sequence of components into a 32 hex char digest
pub(crate) fn hash_parts(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([ID_SEPARATOR]);
        }
        hasher.update(part);
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Closed set of artifact kinds known to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Top-level input document
    Document,

    /// Plain text extracted from a document
    Text,

    /// Markdown slice
    Markdown,

    /// Result of a document layout/intelligence analysis
    DocumentIntelligence,

    /// Rendered page or embedded image
    Image,

    /// Figure extracted from a document
    Figure,

    /// Chunk prepared for indexing
    Chunk,

    /// Summary of other content
    Summary,

    /// Embedding vector
    Embedding,

    /// Anything else, discriminated by label only
    Generic,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 10] = [
        ArtifactKind::Document,
        ArtifactKind::Text,
        ArtifactKind::Markdown,
        ArtifactKind::DocumentIntelligence,
        ArtifactKind::Image,
        ArtifactKind::Figure,
        ArtifactKind::Chunk,
        ArtifactKind::Summary,
        ArtifactKind::Embedding,
        ArtifactKind::Generic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Document => "document",
            ArtifactKind::Text => "text",
            ArtifactKind::Markdown => "markdown",
            ArtifactKind::DocumentIntelligence => "document_intelligence",
            ArtifactKind::Image => "image",
            ArtifactKind::Figure => "figure",
            ArtifactKind::Chunk => "chunk",
            ArtifactKind::Summary => "summary",
            ArtifactKind::Embedding => "embedding",
            ArtifactKind::Generic => "generic",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ArtifactKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_lowercase().replace('-', "_");
        ArtifactKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| anyhow::anyhow!("Unknown artifact kind: {}", s))
    }
}

/// A top-level input unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: ArtifactId,

    /// Human-readable name (usually the file stem)
    pub name: String,

    pub mime_type: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub created_at: DateTime<Utc>,

    #[serde(skip)]
    pub content: Vec<u8>,
}

impl Document {
    /// Create a document whose identity is the hash of its content
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>, mime_type: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: ArtifactId::from_content(&content),
            name: name.into(),
            mime_type: mime_type.into(),
            metadata: Metadata::new(),
            created_at: Utc::now(),
            content,
        }
    }

    /// Override the derived identity
    pub fn with_id(mut self, id: impl Into<ArtifactId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Read a document from a file on disk
    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read(path)
            .await
            .with_context(|| format!("Failed to read document: {}", path.display()))?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        let mime_type = guess_mime_type(path);
        let size = content.len() as u64;

        Ok(Self::new(name, content, mime_type)
            .with_metadata("file_name", file_name)
            .with_metadata("file_path", path.display().to_string())
            .with_metadata("file_size", size))
    }
}

/// An artifact produced by an operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    pub id: ArtifactId,

    pub kind: ArtifactKind,

    /// Semantic role of the fragment (e.g. "summary")
    pub label: String,

    pub mime_type: String,

    #[serde(default)]
    pub metadata: Metadata,

    /// Position within a fan-out batch (0 for scalar results)
    pub ordinal: u32,

    /// Artifact this fragment was derived from
    pub source: ArtifactId,

    /// Root document of the source chain
    pub document: ArtifactId,

    /// Name of the operation that produced this fragment
    pub produced_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,

    pub created_at: DateTime<Utc>,

    #[serde(skip)]
    pub content: Vec<u8>,
}

impl Fragment {
    /// Create a fragment derived from `source`, with a deterministic identity
    pub fn derived_from(
        source: &Artifact,
        kind: ArtifactKind,
        label: impl Into<String>,
        binding: &str,
        ordinal: u32,
    ) -> Self {
        let label = label.into();
        Self {
            id: ArtifactId::derive(source.id(), &label, binding, ordinal),
            kind,
            label,
            mime_type: "application/octet-stream".to_string(),
            metadata: Metadata::new(),
            ordinal,
            source: source.id().clone(),
            document: source.document_id().clone(),
            produced_by: None,
            vector: None,
            created_at: Utc::now(),
            content: Vec::new(),
        }
    }
}

/// Any unit flowing through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Artifact {
    Document(Document),
    Fragment(Fragment),
}

impl Artifact {
    pub fn id(&self) -> &ArtifactId {
        match self {
            Artifact::Document(d) => &d.id,
            Artifact::Fragment(f) => &f.id,
        }
    }

    pub fn kind(&self) -> ArtifactKind {
        match self {
            Artifact::Document(_) => ArtifactKind::Document,
            Artifact::Fragment(f) => f.kind,
        }
    }

    /// Label of a fragment; documents carry none
    pub fn label(&self) -> Option<&str> {
        match self {
            Artifact::Document(_) => None,
            Artifact::Fragment(f) => Some(&f.label),
        }
    }

    /// Root document id (a document is its own root)
    pub fn document_id(&self) -> &ArtifactId {
        match self {
            Artifact::Document(d) => &d.id,
            Artifact::Fragment(f) => &f.document,
        }
    }

    pub fn source(&self) -> Option<&ArtifactId> {
        match self {
            Artifact::Document(_) => None,
            Artifact::Fragment(f) => Some(&f.source),
        }
    }

    pub fn content(&self) -> &[u8] {
        match self {
            Artifact::Document(d) => &d.content,
            Artifact::Fragment(f) => &f.content,
        }
    }

    pub fn set_content(&mut self, content: Vec<u8>) {
        match self {
            Artifact::Document(d) => d.content = content,
            Artifact::Fragment(f) => f.content = content,
        }
    }

    pub fn mime_type(&self) -> &str {
        match self {
            Artifact::Document(d) => &d.mime_type,
            Artifact::Fragment(f) => &f.mime_type,
        }
    }

    pub fn metadata(&self) -> &Metadata {
        match self {
            Artifact::Document(d) => &d.metadata,
            Artifact::Fragment(f) => &f.metadata,
        }
    }

    /// Content decoded as UTF-8 (lossy)
    pub fn content_as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.content())
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Artifact::Document(d) => Some(d),
            Artifact::Fragment(_) => None,
        }
    }

    pub fn as_fragment(&self) -> Option<&Fragment> {
        match self {
            Artifact::Document(_) => None,
            Artifact::Fragment(f) => Some(f),
        }
    }

    /// True when both artifacts would persist to the same bytes.
    ///
    /// Timestamps are ignored so that a re-run producing identical data
    /// counts as the same artifact.
    pub fn same_content(&self, other: &Artifact) -> bool {
        if self.id() != other.id()
            || self.kind() != other.kind()
            || self.label() != other.label()
            || self.mime_type() != other.mime_type()
            || self.content() != other.content()
            || self.metadata() != other.metadata()
        {
            return false;
        }

        match (self, other) {
            (Artifact::Fragment(a), Artifact::Fragment(b)) => {
                a.source == b.source && a.ordinal == b.ordinal && a.vector == b.vector
            }
            (Artifact::Document(_), Artifact::Document(_)) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Artifact::Document(d) => write!(f, "{}:document[{}]", d.id, d.name),
            Artifact::Fragment(frag) => {
                write!(f, "{}:{}[{}#{}]", frag.id, frag.kind, frag.label, frag.ordinal)
            }
        }
    }
}

impl From<Document> for Artifact {
    fn from(d: Document) -> Self {
        Artifact::Document(d)
    }
}

impl From<Fragment> for Artifact {
    fn from(f: Fragment) -> Self {
        Artifact::Fragment(f)
    }
}

/// Guess a MIME type from a file extension
pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}
