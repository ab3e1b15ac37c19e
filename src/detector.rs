use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::git::GitPerformanceOptimizer;
use crate::scan::{DocumentPatterns, scan_documents};
use crate::vcs::VcsRunner;

/// Commit id recorded when HEAD could not be resolved.
pub const UNKNOWN_COMMIT: &str = "unknown";

/// Finds completion documents added since a commit. Falls back to a full
/// filesystem walk whenever the VCS cannot answer.
pub struct NewDocumentDetector {
    working_dir: PathBuf,
    vcs: Arc<dyn VcsRunner>,
    optimizer: Arc<GitPerformanceOptimizer>,
    patterns: DocumentPatterns,
}

impl NewDocumentDetector {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        vcs: Arc<dyn VcsRunner>,
        optimizer: Arc<GitPerformanceOptimizer>,
        patterns: DocumentPatterns,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            vcs,
            optimizer,
            patterns,
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub async fn detect_new_documents(&self, since: Option<&str>) -> Result<Vec<String>> {
        let since = since.filter(|c| !c.is_empty() && *c != UNKNOWN_COMMIT);
        let Some(since) = since else {
            debug!("no prior commit, scanning for all documents");
            return self.scan_all().await;
        };

        match self.optimizer.added_files_since(since).await {
            Ok(added) => {
                let found = self.patterns.filter(added.iter());
                info!(since = %since, count = found.len(), "detected new documents from git");
                Ok(found)
            }
            Err(err) => {
                warn!(since = %since, error = %format!("{err:#}"), "git change detection failed, falling back to full scan");
                self.scan_all().await
            }
        }
    }

    async fn scan_all(&self) -> Result<Vec<String>> {
        let root = self.working_dir.clone();
        let patterns = self.patterns.clone();
        let found = tokio::task::spawn_blocking(move || scan_documents(&root, &patterns)).await??;
        info!(count = found.len(), "full scan found documents");
        Ok(found)
    }

    /// HEAD, or `"unknown"` when it cannot be resolved.
    pub async fn current_commit(&self) -> String {
        match self.vcs.run(&["rev-parse", "HEAD"]).await {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            Ok(_) => UNKNOWN_COMMIT.to_string(),
            Err(err) => {
                debug!(error = %format!("{err:#}"), "could not resolve HEAD");
                UNKNOWN_COMMIT.to_string()
            }
        }
    }
}
