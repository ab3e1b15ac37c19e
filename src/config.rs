use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::doc_cache::DocumentCacheConfig;
use crate::extract::DEFAULT_BREAKING_KEYWORDS;
use crate::git::GitConfig;
use crate::parallel::ParallelConfig;
use crate::scan::DEFAULT_DOCUMENT_PATTERNS;
use crate::state::DEFAULT_STATE_PATH;

pub const CONFIG_PATH: &str = ".release-impact/config.json";
pub const STATE_PATH_ENV: &str = "RELEASE_IMPACT_STATE";

/// Settings read from `.release-impact/config.json`. Every field is
/// optional in the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub document_patterns: Vec<String>,
    /// Relative paths resolve against the working directory.
    pub state_path: Option<PathBuf>,
    #[serde(with = "duration_ms")]
    pub performance_budget: Duration,
    pub breaking_keywords: Vec<String>,
    pub document_cache: DocumentCacheConfig,
    pub git: GitConfig,
    pub parallel: ParallelConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            document_patterns: DEFAULT_DOCUMENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            state_path: None,
            performance_budget: Duration::from_millis(5000),
            breaking_keywords: DEFAULT_BREAKING_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            document_cache: DocumentCacheConfig::default(),
            git: GitConfig::default(),
            parallel: ParallelConfig::default(),
        }
    }
}

/// Defaults when the file is absent; a present but unreadable file is an
/// error.
pub fn load_config(working_dir: &Path) -> Result<AnalysisConfig> {
    let path = working_dir.join(CONFIG_PATH);
    if !path.exists() {
        return Ok(AnalysisConfig::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn resolve_working_dir(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.repo.clone() {
        return Ok(p);
    }
    env::current_dir().context("Failed to resolve current directory")
}

/// `--state`, then `RELEASE_IMPACT_STATE`, then the config file, then the
/// default location under the working directory.
pub fn resolve_state_path(cli: &Cli, working_dir: &Path, config: &AnalysisConfig) -> PathBuf {
    if let Some(p) = cli.state.clone() {
        return p;
    }

    if let Ok(p) = env::var(STATE_PATH_ENV)
        && !p.is_empty()
    {
        return PathBuf::from(p);
    }

    match config.state_path.as_ref() {
        Some(p) if p.is_absolute() => p.clone(),
        Some(p) => working_dir.join(p),
        None => working_dir.join(DEFAULT_STATE_PATH),
    }
}

/// Serialises a `Duration` as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
