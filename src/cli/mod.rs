//! Command-line interface for catalyst.
//!
//! Provides commands for seeding a repository with documents, running the
//! built-in text pipeline, inspecting stored artifacts and reading back the
//! operations log.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::config;
use crate::core::{
    ArtifactQuery, LocalRepository, PipelineGraph, Repository, RepositoryError, RunOptions, Runner,
};
use crate::domain::{ArtifactId, ArtifactKind, Document, EventFilter, RunSummary};
use crate::pipelines;

/// catalyst - Resumable document-to-artifact pipeline engine
#[derive(Parser, Debug)]
#[command(name = "catalyst")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Repository directory (defaults to the configured one)
    #[arg(short, long, global = true, env = "CATALYST_REPOSITORY")]
    pub repository: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Add documents from files (glob patterns allowed)
    Add {
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// List stored artifacts
    Ls {
        /// Filter by kind (e.g. text, markdown, summary)
        #[arg(short, long)]
        kind: Option<ArtifactKind>,

        /// Filter by label
        #[arg(short, long)]
        label: Option<String>,

        /// Filter by root document id
        #[arg(short, long)]
        document: Option<String>,
    },

    /// Show an artifact record
    Show {
        id: String,

        /// Print the content instead of the record
        #[arg(short, long)]
        content: bool,
    },

    /// Delete a single artifact
    Rm { id: String },

    /// Run the built-in text pipeline
    Run {
        /// Only process these documents
        #[arg(short, long = "document")]
        documents: Vec<String>,

        /// Stop after the first failed binding
        #[arg(long)]
        fail_fast: bool,

        /// Documents processed at the same time
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,
    },

    /// Describe the built-in pipeline
    Describe {
        /// Print the graph as JSON instead of Mermaid
        #[arg(long)]
        json: bool,

        /// Include stored artifact counts
        #[arg(long)]
        counts: bool,
    },

    /// Show the operations log
    Log {
        #[arg(long)]
        run: Option<Uuid>,

        #[arg(long)]
        operation: Option<String>,

        #[arg(long)]
        document: Option<String>,

        /// Maximum number of events to show (most recent)
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let repository = self.repository;
        match self.command {
            Commands::Add { paths } => add_documents(repository, &paths).await,
            Commands::Ls {
                kind,
                label,
                document,
            } => list_artifacts(repository, kind, label, document).await,
            Commands::Show { id, content } => show_artifact(repository, &id, content).await,
            Commands::Rm { id } => remove_artifact(repository, &id).await,
            Commands::Run {
                documents,
                fail_fast,
                concurrency,
            } => run_pipeline(repository, documents, fail_fast, concurrency).await,
            Commands::Describe { json, counts } => describe(repository, json, counts).await,
            Commands::Log {
                run,
                operation,
                document,
                limit,
            } => show_log(repository, run, operation, document, limit).await,
            Commands::Runs { limit } => list_runs(repository, limit).await,
            Commands::Config => show_config(),
        }
    }
}

/// Open the repository given on the command line, or the configured one
async fn open_repository(path: Option<PathBuf>) -> Result<LocalRepository> {
    let path = match path {
        Some(path) => path,
        None => config::repository_dir()?,
    };
    LocalRepository::open(&path)
        .await
        .with_context(|| format!("Failed to open repository: {}", path.display()))
}

/// Expand glob patterns; plain paths are kept as given
fn expand_paths(patterns: &[String]) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for pattern in patterns {
        if !pattern.contains(['*', '?', '[']) {
            paths.push(PathBuf::from(pattern));
            continue;
        }

        let mut matched = false;
        for entry in glob::glob(pattern).with_context(|| format!("Invalid pattern: {}", pattern))? {
            let path = entry.with_context(|| format!("Failed to read match for {}", pattern))?;
            if path.is_file() {
                paths.push(path);
                matched = true;
            }
        }
        if !matched {
            tracing::warn!(%pattern, "Pattern matched no files");
        }
    }
    Ok(paths)
}

async fn add_documents(repository: Option<PathBuf>, patterns: &[String]) -> Result<()> {
    let repo = open_repository(repository).await?;

    for path in expand_paths(patterns)? {
        let document = Document::from_file(&path).await?;
        let name = document.name.clone();
        match repo.put(document.into()).await {
            Ok(id) => println!("{}  {}", id, name),
            Err(RepositoryError::DuplicateArtifact(id)) => {
                eprintln!("{}  {} (already stored from another path)", id, name);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to add {}", path.display()));
            }
        }
    }

    Ok(())
}

async fn list_artifacts(
    repository: Option<PathBuf>,
    kind: Option<ArtifactKind>,
    label: Option<String>,
    document: Option<String>,
) -> Result<()> {
    let repo = open_repository(repository).await?;
    let query = ArtifactQuery {
        kind,
        label,
        document: document.map(ArtifactId::new),
    };

    let entries = repo.entries(&query).await;
    if entries.is_empty() {
        println!("No artifacts found");
        return Ok(());
    }

    println!("{:<34} {:<22} {:<16} {:<34}", "ID", "KIND", "LABEL", "DOCUMENT");
    println!("{}", "-".repeat(108));
    for entry in entries {
        println!(
            "{:<34} {:<22} {:<16} {:<34}",
            entry.id,
            entry.kind,
            entry.label.as_deref().unwrap_or("-"),
            entry.document
        );
    }

    Ok(())
}

async fn show_artifact(repository: Option<PathBuf>, id: &str, content: bool) -> Result<()> {
    let repo = open_repository(repository).await?;
    let artifact = repo.get(&ArtifactId::new(id)).await?;

    if content {
        println!("{}", artifact.content_as_str());
    } else {
        println!("{}", serde_json::to_string_pretty(&artifact)?);
        println!("({} bytes of content)", artifact.content().len());
    }

    Ok(())
}

async fn remove_artifact(repository: Option<PathBuf>, id: &str) -> Result<()> {
    let repo = open_repository(repository).await?;
    let artifact = repo.delete(&ArtifactId::new(id)).await?;
    println!("Deleted {}", artifact);
    Ok(())
}

async fn run_pipeline(
    repository: Option<PathBuf>,
    documents: Vec<String>,
    fail_fast: bool,
    concurrency: Option<usize>,
) -> Result<()> {
    let settings = &config::config()?.run;
    let mut options = RunOptions::from(settings);
    options.fail_fast |= fail_fast;
    if let Some(concurrency) = concurrency {
        options.max_concurrent_documents = concurrency.max(1);
    }

    let repo: Arc<dyn Repository> = Arc::new(open_repository(repository).await?);
    let runner = Runner::new(pipelines::text::registry()?, repo).with_options(options);

    let report = if documents.is_empty() {
        runner.run().await?
    } else {
        let ids: Vec<ArtifactId> = documents.into_iter().map(ArtifactId::new).collect();
        runner.run_documents(&ids).await?
    };

    println!(
        "{:<34} {:<12} {:>8} {:>8} {:>8}",
        "DOCUMENT", "STATUS", "EXECUTED", "SKIPPED", "FAILED"
    );
    println!("{}", "-".repeat(74));
    for document in &report.documents {
        println!(
            "{:<34} {:<12} {:>8} {:>8} {:>8}",
            document.document,
            format!("{:?}", document.status).to_lowercase(),
            document.executed,
            document.skipped,
            document.failures.len()
        );
    }

    for failure in report.failures() {
        eprintln!(
            "  {} on {} [{}]: {}",
            failure.operation, failure.document, failure.binding_key, failure.error
        );
    }

    if report.is_success() {
        eprintln!("\n[Run {} completed: {} fragments produced]", report.run_id, report.produced());
    } else {
        let state = if report.aborted { "aborted" } else { "completed with failures" };
        eprintln!("\n[Run {} {}]", report.run_id, state);
        std::process::exit(1);
    }

    Ok(())
}

async fn describe(repository: Option<PathBuf>, json: bool, counts: bool) -> Result<()> {
    let registry = pipelines::text::registry()?;
    let mut graph = PipelineGraph::from_registry(&registry);

    if counts {
        let repo = open_repository(repository).await?;
        graph = graph.with_counts(&repo).await?;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&graph)?);
    } else {
        println!("{}", graph.to_mermaid());
    }

    Ok(())
}

async fn show_log(
    repository: Option<PathBuf>,
    run: Option<Uuid>,
    operation: Option<String>,
    document: Option<String>,
    limit: usize,
) -> Result<()> {
    let repo = open_repository(repository).await?;
    let filter = EventFilter {
        run_id: run,
        operation,
        document: document.map(ArtifactId::new),
        event_type: None,
    };

    let events = repo.events(&filter).await?;
    if events.is_empty() {
        println!("No events found");
        return Ok(());
    }

    for event in events.iter().skip(events.len().saturating_sub(limit)) {
        let mut line = format!(
            "{} {:<20} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", event.event_type),
            event.payload_summary
        );
        if let Some(ms) = event.duration_ms {
            line.push_str(&format!(" ({}ms)", ms));
        }
        if let Some(ref error) = event.error {
            line.push_str(&format!(" - {}", error));
        }
        println!("{}", line);
    }

    Ok(())
}

async fn list_runs(repository: Option<PathBuf>, limit: usize) -> Result<()> {
    let repo = open_repository(repository).await?;
    let events = repo.events(&EventFilter::default()).await?;
    let runs = RunSummary::group(&events);

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<10} {:>6} {:>6} {:>9}",
        "RUN ID", "STARTED", "STATE", "DONE", "FAILED", "FRAGMENTS"
    );
    println!("{}", "-".repeat(94));

    for run in runs.iter().rev().take(limit) {
        println!(
            "{:<38} {:<20} {:<10} {:>6} {:>6} {:>9}",
            run.run_id,
            run.started_at.format("%Y-%m-%d %H:%M:%S"),
            format!("{:?}", run.state).to_lowercase(),
            run.bindings_completed,
            run.bindings_failed,
            run.fragments_produced
        );
    }

    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!(
        "Config file: {}",
        cfg.config_file
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Repository: {}", cfg.repository.display());
    println!();
    println!("Run:");
    println!("  fail_fast:                {}", cfg.run.fail_fast);
    println!("  max_concurrent_documents: {}", cfg.run.max_concurrent_documents);
    println!();
    println!("Environment overrides:");
    for key in [config::ENV_HOME, config::ENV_REPOSITORY] {
        println!(
            "  {}: {}",
            key,
            std::env::var(key).unwrap_or_else(|_| "(not set)".to_string())
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "catalyst", "--repository", "/tmp/repo", "run", "-d", "abc", "--fail-fast", "-j", "4",
        ])
        .unwrap();

        assert_eq!(cli.repository, Some(PathBuf::from("/tmp/repo")));
        match cli.command {
            Commands::Run {
                documents,
                fail_fast,
                concurrency,
            } => {
                assert_eq!(documents, vec!["abc".to_string()]);
                assert!(fail_fast);
                assert_eq!(concurrency, Some(4));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_kind() {
        let cli = Cli::try_parse_from(["catalyst", "ls", "--kind", "summary"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Ls {
                kind: Some(ArtifactKind::Summary),
                ..
            }
        ));
        assert!(Cli::try_parse_from(["catalyst", "ls", "--kind", "video"]).is_err());
    }

    #[test]
    fn test_expand_paths() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "a").unwrap();
        std::fs::write(temp.path().join("b.txt"), "b").unwrap();
        std::fs::write(temp.path().join("c.md"), "c").unwrap();

        let pattern = format!("{}/*.txt", temp.path().display());
        let literal = temp.path().join("c.md").display().to_string();
        let paths = expand_paths(&[pattern, literal]).unwrap();

        assert_eq!(paths.len(), 3);
        assert!(paths[0].ends_with("a.txt"));
        assert!(paths[1].ends_with("b.txt"));
        assert!(paths[2].ends_with("c.md"));
    }
}
