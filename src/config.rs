//! Configuration for catalyst.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (CATALYST_HOME, CATALYST_REPOSITORY)
//! 2. Config file (.catalyst/config.yaml)
//! 3. Defaults (~/.catalyst)
//!
//! Config file discovery:
//! - Searches current directory and parents for .catalyst/config.yaml
//! - `home` is relative to the .catalyst directory, `repository.path` to
//!   the project root (the directory holding .catalyst)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::RunOptions;

const CONFIG_DIR: &str = ".catalyst";
const CONFIG_FILE: &str = "config.yaml";

pub const ENV_HOME: &str = "CATALYST_HOME";
pub const ENV_REPOSITORY: &str = "CATALYST_REPOSITORY";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub home: Option<String>,
    #[serde(default)]
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunConfig {
    pub fail_fast: Option<bool>,
    pub max_concurrent_documents: Option<usize>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Artifact repository root
    pub repository: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub run: RunSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSettings {
    pub fail_fast: bool,
    pub max_concurrent_documents: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_concurrent_documents: 1,
        }
    }
}

impl From<&RunSettings> for RunOptions {
    fn from(settings: &RunSettings) -> Self {
        RunOptions {
            fail_fast: settings.fail_fast,
            max_concurrent_documents: settings.max_concurrent_documents.max(1),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Resolve configuration starting the file search at `start`.
///
/// `env` looks up environment variables.
fn resolve(start: &Path, env: impl Fn(&str) -> Option<String>) -> Result<ResolvedConfig> {
    let config_file = find_config_file(start);
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    let config_dir = config_file.as_deref().and_then(Path::parent);
    let project_root = config_dir.and_then(Path::parent);

    let home = match (env(ENV_HOME), config_dir, file.home.as_deref()) {
        (Some(home), _, _) => PathBuf::from(home),
        (None, Some(dir), Some(home)) => resolve_path(dir, home),
        _ => dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(CONFIG_DIR),
    };

    let repository = match (env(ENV_REPOSITORY), project_root, file.repository.path.as_deref()) {
        (Some(repository), _, _) => PathBuf::from(repository),
        (None, Some(root), Some(path)) => resolve_path(root, path),
        _ => home.join("repository"),
    };

    let defaults = RunSettings::default();
    let run = RunSettings {
        fail_fast: file.run.fail_fast.unwrap_or(defaults.fail_fast),
        max_concurrent_documents: file
            .run
            .max_concurrent_documents
            .unwrap_or(defaults.max_concurrent_documents),
    };

    Ok(ResolvedConfig {
        home,
        repository,
        config_file,
        run,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    resolve(&cwd, |key| std::env::var(key).ok())
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the catalyst home directory (engine state)
pub fn catalyst_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the default repository root
pub fn repository_dir() -> Result<PathBuf> {
    Ok(config()?.repository.clone())
}
