//! Durable analysis state: one pretty-printed JSON file, replaced whole.
//!
//! A state file is either fully valid or treated as absent. Writes go to a
//! sibling temp file that is renamed over the target, so a reader never sees
//! a half-written state.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::ReleaseImpactError;

pub const STATE_VERSION: &str = "1.0.0";
pub const DEFAULT_STATE_PATH: &str = ".release-impact/analysis-state.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactLevel {
    Patch,
    Minor,
    Major,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentAnalysisResult {
    pub file_path: String,
    pub spec_name: String,
    pub task_number: String,
    pub impact_level: ImpactLevel,
    pub release_note_content: String,
    pub analyzed_at_commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisState {
    pub last_analyzed_commit: String,
    pub accumulated_results: Vec<DocumentAnalysisResult>,
    pub last_analyzed_at: DateTime<Utc>,
    pub version: String,
}

impl AnalysisState {
    pub fn new(last_analyzed_commit: impl Into<String>, accumulated_results: Vec<DocumentAnalysisResult>) -> Self {
        Self {
            last_analyzed_commit: last_analyzed_commit.into(),
            accumulated_results,
            last_analyzed_at: Utc::now(),
            version: STATE_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AnalysisStateManager {
    state_path: PathBuf,
}

impl AnalysisStateManager {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
        }
    }

    pub fn for_working_dir(working_dir: &Path) -> Self {
        Self::new(working_dir.join(DEFAULT_STATE_PATH))
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Returns `None` for an absent, unparsable, or structurally invalid
    /// file. Never partially recovers.
    pub async fn load_state(&self) -> Option<AnalysisState> {
        match self.read_state().await {
            Ok(Some(state)) => {
                debug!(
                    path = %self.state_path.display(),
                    commit = %state.last_analyzed_commit,
                    results = state.accumulated_results.len(),
                    "loaded analysis state"
                );
                Some(state)
            }
            Ok(None) => {
                debug!(path = %self.state_path.display(), "no analysis state found");
                None
            }
            Err(err) => {
                match err.downcast_ref::<ReleaseImpactError>() {
                    Some(ReleaseImpactError::StateUnparsable(reason)) => {
                        warn!(path = %self.state_path.display(), reason = %reason, "analysis state is unparsable, ignoring it")
                    }
                    Some(ReleaseImpactError::StateInvalid(reason)) => {
                        warn!(path = %self.state_path.display(), reason = %reason, "analysis state has an invalid structure, ignoring it")
                    }
                    _ => warn!(path = %self.state_path.display(), error = %format!("{err:#}"), "failed to read analysis state"),
                }
                None
            }
        }
    }

    pub(crate) async fn read_state(&self) -> Result<Option<AnalysisState>> {
        let raw = match tokio::fs::read_to_string(&self.state_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read state file: {}", self.state_path.display()));
            }
        };

        let value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| ReleaseImpactError::StateUnparsable(e.to_string()))?;
        let state: AnalysisState =
            serde_json::from_value(value).map_err(|e| ReleaseImpactError::StateInvalid(e.to_string()))?;
        Ok(Some(state))
    }

    /// Returns `false` when the write failed; the previous file, if any, is
    /// left as it was.
    pub async fn save_state(&self, state: &AnalysisState) -> bool {
        match self.write_state(state).await {
            Ok(()) => {
                info!(
                    path = %self.state_path.display(),
                    commit = %state.last_analyzed_commit,
                    results = state.accumulated_results.len(),
                    "saved analysis state"
                );
                true
            }
            Err(err) => {
                error!(path = %self.state_path.display(), error = %format!("{err:#}"), "failed to save analysis state");
                false
            }
        }
    }

    async fn write_state(&self, state: &AnalysisState) -> Result<()> {
        if let Some(parent) = self.state_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(state).context("Failed to serialise analysis state")?;

        let mut tmp_os = self.state_path.as_os_str().to_os_string();
        tmp_os.push(".tmp");
        let tmp = PathBuf::from(tmp_os);
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write temp state file: {}", tmp.display()))?;

        if let Err(e) = tokio::fs::rename(&tmp, &self.state_path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| {
                format!("Failed to atomically replace state file: {}", self.state_path.display())
            });
        }
        Ok(())
    }

    pub async fn reset_state(&self) {
        match tokio::fs::remove_file(&self.state_path).await {
            Ok(()) => info!(path = %self.state_path.display(), "analysis state reset"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.state_path.display(), "no analysis state to reset")
            }
            Err(e) => error!(path = %self.state_path.display(), error = %e, "failed to reset analysis state"),
        }
    }
}
