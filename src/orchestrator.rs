//! One analysis run: load state, detect new documents, analyse and append,
//! persist. State is written only after every earlier step succeeded.

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::analyzer::AppendOnlyAnalyzer;
use crate::collector::CompletionDocumentCollector;
use crate::config::AnalysisConfig;
use crate::detector::NewDocumentDetector;
use crate::doc_cache::DocumentParsingCache;
use crate::extract::SectionChangeExtractor;
use crate::git::GitPerformanceOptimizer;
use crate::monitor::{PerformanceMonitor, PerformanceReport};
use crate::scan::DocumentPatterns;
use crate::state::{AnalysisState, AnalysisStateManager, DocumentAnalysisResult};
use crate::vcs::{GitCli, VcsRunner};

pub const DEFAULT_PERFORMANCE_BUDGET: Duration = Duration::from_millis(5000);

/// Milliseconds spent in each phase of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPerformance {
    pub total_time: f64,
    pub state_load_time: f64,
    pub detection_time: f64,
    pub commit_lookup_time: f64,
    pub analysis_time: f64,
    pub state_save_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetadata {
    pub total_documents: usize,
    pub new_documents: usize,
    pub skipped_documents: usize,
    /// Detected documents that could not be collected or analysed.
    pub dropped_documents: usize,
    pub current_commit: String,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseAnalysisResult {
    pub results: Vec<DocumentAnalysisResult>,
    pub performance_metrics: AnalysisPerformance,
    pub metadata: AnalysisMetadata,
}

pub struct ReleaseAnalysisOrchestrator {
    state: AnalysisStateManager,
    detector: NewDocumentDetector,
    analyzer: AppendOnlyAnalyzer,
    optimizer: Arc<GitPerformanceOptimizer>,
    monitor: PerformanceMonitor,
    budget: Duration,
}

impl ReleaseAnalysisOrchestrator {
    pub fn new(
        state: AnalysisStateManager,
        detector: NewDocumentDetector,
        analyzer: AppendOnlyAnalyzer,
        optimizer: Arc<GitPerformanceOptimizer>,
    ) -> Self {
        Self {
            state,
            detector,
            analyzer,
            optimizer,
            monitor: PerformanceMonitor::new(),
            budget: DEFAULT_PERFORMANCE_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Wires the default collaborators around the `git` CLI.
    pub fn from_config(working_dir: &Path, state_path: PathBuf, config: &AnalysisConfig) -> Result<Self> {
        Self::with_vcs(working_dir, state_path, config, Arc::new(GitCli::new(working_dir)))
    }

    pub fn with_vcs(
        working_dir: &Path,
        state_path: PathBuf,
        config: &AnalysisConfig,
        vcs: Arc<dyn VcsRunner>,
    ) -> Result<Self> {
        let patterns = DocumentPatterns::new(&config.document_patterns)?;
        let optimizer = Arc::new(GitPerformanceOptimizer::new(vcs.clone(), config.git.clone()));
        let detector = NewDocumentDetector::new(working_dir, vcs.clone(), optimizer.clone(), patterns);

        let cache = Arc::new(DocumentParsingCache::new(working_dir, config.document_cache.clone()).with_vcs(vcs));
        let collector = Arc::new(CompletionDocumentCollector::new(cache, config.parallel.clone()));
        let extractor = Arc::new(SectionChangeExtractor::with_keywords(&config.breaking_keywords));
        let analyzer = AppendOnlyAnalyzer::new(collector, extractor);

        Ok(Self::new(AnalysisStateManager::new(state_path), detector, analyzer, optimizer)
            .with_budget(config.performance_budget))
    }

    pub fn state_manager(&self) -> &AnalysisStateManager {
        &self.state
    }

    pub fn optimizer(&self) -> &Arc<GitPerformanceOptimizer> {
        &self.optimizer
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.monitor.generate_report()
    }

    pub async fn analyze(&self) -> Result<ReleaseAnalysisResult> {
        let started = Instant::now();

        let (prior, load) = self.monitor.measure("load_state", self.state.load_state()).await;
        let (since, accumulated) = match prior {
            Some(state) => (Some(state.last_analyzed_commit), state.accumulated_results),
            None => (None, Vec::new()),
        };

        let (detected, detection) = self
            .monitor
            .measure_result("detect_new_documents", self.detector.detect_new_documents(since.as_deref()))
            .await;
        let new_paths = detected?;

        let (current_commit, commit_lookup) = self
            .monitor
            .measure("current_commit", self.detector.current_commit())
            .await;

        let skipped_documents = accumulated.len();
        let (outcome, analysis) = self
            .monitor
            .measure(
                "analyze_and_append",
                self.analyzer.analyze_and_append(&new_paths, accumulated, &current_commit),
            )
            .await;
        if let Some(error) = outcome.collection_error {
            bail!("document collection failed, state left unchanged: {error}");
        }
        let new_documents = outcome.appended;

        let state = AnalysisState::new(current_commit.clone(), outcome.results);
        let (saved, save) = self.monitor.measure("save_state", self.state.save_state(&state)).await;
        if !saved {
            warn!(path = %self.state.state_path().display(), "analysis finished but state was not persisted");
        }

        let total_time = started.elapsed().as_secs_f64() * 1000.0;
        if total_time > self.budget.as_secs_f64() * 1000.0 {
            warn!(
                total_ms = total_time,
                budget_ms = self.budget.as_millis() as u64,
                "analysis exceeded performance budget"
            );
        }

        let metadata = AnalysisMetadata {
            total_documents: state.accumulated_results.len(),
            new_documents,
            skipped_documents,
            dropped_documents: new_paths.len().saturating_sub(new_documents),
            current_commit,
            analyzed_at: state.last_analyzed_at,
        };
        info!(
            new = metadata.new_documents,
            skipped = metadata.skipped_documents,
            dropped = metadata.dropped_documents,
            total = metadata.total_documents,
            commit = %metadata.current_commit,
            elapsed_ms = total_time,
            "analysis complete"
        );

        Ok(ReleaseAnalysisResult {
            results: state.accumulated_results,
            performance_metrics: AnalysisPerformance {
                total_time,
                state_load_time: load.duration,
                detection_time: detection.duration,
                commit_lookup_time: commit_lookup.duration,
                analysis_time: analysis.duration,
                state_save_time: save.duration,
            },
            metadata,
        })
    }

    pub async fn analyze_full_reset(&self) -> Result<ReleaseAnalysisResult> {
        self.state.reset_state().await;
        self.analyze().await
    }
}
