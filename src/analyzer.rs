//! Append-only analysis: only new documents are analysed, and their results
//! are appended to the accumulated list. Prior results are never rederived
//! or rewritten.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collector::DocumentCollector;
use crate::document::{CompletionDocument, spec_name_from_path, task_number_from_path};
use crate::extract::{ChangeExtractor, ExtractedChanges};
use crate::state::{DocumentAnalysisResult, ImpactLevel};

const RELEASE_NOTE_SECTIONS: &[&str] = &["summary", "overview", "implementation details"];

pub struct AppendOnlyAnalyzer {
    collector: Arc<dyn DocumentCollector>,
    extractor: Arc<dyn ChangeExtractor>,
}

impl AppendOnlyAnalyzer {
    pub fn new(collector: Arc<dyn DocumentCollector>, extractor: Arc<dyn ChangeExtractor>) -> Self {
        Self { collector, extractor }
    }

    /// Returns `accumulated` followed by results for `new_paths`, in input
    /// order. With nothing new, or when collection fails as a whole,
    /// `accumulated` comes back untouched; the latter also sets
    /// `collection_error` so the caller can refuse to persist.
    pub async fn analyze_and_append(
        &self,
        new_paths: &[String],
        accumulated: Vec<DocumentAnalysisResult>,
        current_commit: &str,
    ) -> AppendOutcome {
        if new_paths.is_empty() {
            debug!(accumulated = accumulated.len(), "no new documents to analyse");
            return AppendOutcome::unchanged(accumulated);
        }

        let collected = match self.collector.collect_from_paths(new_paths).await {
            Ok(collected) => collected,
            Err(err) => {
                let error = format!("{err:#}");
                warn!(count = new_paths.len(), error = %error, "document collection failed, keeping accumulated results");
                return AppendOutcome {
                    results: accumulated,
                    appended: 0,
                    collection_error: Some(error),
                };
            }
        };

        for error in &collected.errors {
            warn!(path = %error.file_path, error = %error.error, "skipping document");
        }
        for warning in &collected.warnings {
            debug!(warning = %warning, "collection warning");
        }

        let mut merged = accumulated;
        let before = merged.len();
        for document in &collected.documents {
            match self.extractor.parse_completion_document(document).await {
                Ok(changes) => merged.push(analysis_result(document, &changes, current_commit)),
                Err(err) => {
                    warn!(path = %document.path, error = %format!("{err:#}"), "change extraction failed, skipping document")
                }
            }
        }

        let appended = merged.len() - before;
        info!(
            requested = new_paths.len(),
            analysed = appended,
            total = merged.len(),
            "appended new analysis results"
        );
        AppendOutcome {
            results: merged,
            appended,
            collection_error: None,
        }
    }
}

/// Output of one append step.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    pub results: Vec<DocumentAnalysisResult>,
    /// Results added by this step; excludes dropped documents.
    pub appended: usize,
    pub collection_error: Option<String>,
}

impl AppendOutcome {
    fn unchanged(results: Vec<DocumentAnalysisResult>) -> Self {
        Self {
            results,
            appended: 0,
            collection_error: None,
        }
    }
}

fn analysis_result(document: &CompletionDocument, changes: &ExtractedChanges, current_commit: &str) -> DocumentAnalysisResult {
    let analyzed_at_commit = if document.git_commit.is_empty() {
        current_commit.to_string()
    } else {
        document.git_commit.clone()
    };
    DocumentAnalysisResult {
        file_path: document.path.clone(),
        spec_name: spec_name_from_path(&document.path),
        task_number: task_number_from_path(&document.path),
        impact_level: impact_level(changes),
        release_note_content: release_note_content(document),
        analyzed_at_commit,
    }
}

pub fn impact_level(changes: &ExtractedChanges) -> ImpactLevel {
    if !changes.breaking_changes.is_empty() {
        ImpactLevel::Major
    } else if !changes.new_features.is_empty() {
        ImpactLevel::Minor
    } else {
        ImpactLevel::Patch
    }
}

/// First non-empty section body among Summary, Overview, and
/// Implementation Details; then the title; then the first paragraph that
/// is not a heading.
pub fn release_note_content(document: &CompletionDocument) -> String {
    let content = document.content.replace("\r\n", "\n");

    for wanted in RELEASE_NOTE_SECTIONS {
        if let Some(body) = section_body(&content, wanted) {
            return body;
        }
    }

    if !document.metadata.title.is_empty() {
        return document.metadata.title.clone();
    }

    content
        .split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty() && !p.starts_with('#'))
        .unwrap_or_default()
        .to_string()
}

fn section_body(content: &str, wanted: &str) -> Option<String> {
    let mut lines = content.lines();
    lines.find(|line| {
        line.trim()
            .strip_prefix('#')
            .is_some_and(|h| h.trim_start_matches('#').trim().trim_end_matches(':').eq_ignore_ascii_case(wanted))
    })?;

    let body: Vec<&str> = lines.take_while(|line| !line.trim_start().starts_with('#')).collect();
    let body = body.join("\n").trim().to_string();
    (!body.is_empty()).then_some(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{CollectionError, CollectionErrorKind, DocumentCollectionResult};
    use crate::document::extract_document_metadata;
    use crate::extract::SectionChangeExtractor;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn doc(path: &str, content: &str, commit: &str) -> CompletionDocument {
        CompletionDocument {
            path: path.to_string(),
            content: content.to_string(),
            last_modified: Utc::now(),
            git_commit: commit.to_string(),
            metadata: extract_document_metadata(content, path),
        }
    }

    #[derive(Default)]
    struct FakeCollector {
        documents: HashMap<String, CompletionDocument>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeCollector {
        fn with(docs: Vec<CompletionDocument>) -> Self {
            Self {
                documents: docs.into_iter().map(|d| (d.path.clone(), d)).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DocumentCollector for FakeCollector {
        async fn collect_from_paths(&self, paths: &[String]) -> Result<DocumentCollectionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("collector unavailable");
            }
            let mut result = DocumentCollectionResult::default();
            for path in paths {
                match self.documents.get(path) {
                    Some(d) => result.documents.push(d.clone()),
                    None => result.errors.push(CollectionError {
                        file_path: path.clone(),
                        error: "missing".to_string(),
                        kind: CollectionErrorKind::NotFound,
                        recoverable: false,
                    }),
                }
            }
            Ok(result)
        }
    }

    struct SlowExtractor;

    #[async_trait]
    impl ChangeExtractor for SlowExtractor {
        async fn parse_completion_document(&self, _: &CompletionDocument) -> Result<ExtractedChanges> {
            tokio::time::sleep(Duration::from_millis(2)).await;
            Ok(ExtractedChanges::default())
        }
    }

    struct PickyExtractor;

    #[async_trait]
    impl ChangeExtractor for PickyExtractor {
        async fn parse_completion_document(&self, document: &CompletionDocument) -> Result<ExtractedChanges> {
            if document.content.contains("unparseable") {
                bail!("cannot read changes");
            }
            Ok(ExtractedChanges::default())
        }
    }

    fn prior(n: usize) -> Vec<DocumentAnalysisResult> {
        (0..n)
            .map(|i| DocumentAnalysisResult {
                file_path: format!("docs/specs/old/task-{i}-summary.md"),
                spec_name: "old".to_string(),
                task_number: i.to_string(),
                impact_level: ImpactLevel::Patch,
                release_note_content: format!("Old {i}"),
                analyzed_at_commit: "c0".to_string(),
            })
            .collect()
    }

    fn analyzer(collector: Arc<FakeCollector>) -> AppendOnlyAnalyzer {
        AppendOnlyAnalyzer::new(collector, Arc::new(SectionChangeExtractor::new()))
    }

    #[tokio::test]
    async fn nothing_new_returns_the_same_allocation() {
        let collector = Arc::new(FakeCollector::default());
        let accumulated = prior(3);
        let ptr = accumulated.as_ptr();

        let out = analyzer(collector.clone()).analyze_and_append(&[], accumulated, "c1").await;
        assert_eq!(out.appended, 0);
        assert!(out.collection_error.is_none());
        let out = out.results;
        assert_eq!(out.as_ptr(), ptr);
        assert_eq!(out, prior(3));
        assert_eq!(collector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn new_results_follow_accumulated_in_input_order() {
        let docs = vec![
            doc(
                "docs/specs/002-api/task-3-summary.md",
                "# Task 3\n\n## Summary\n\nReworked the API.\n\n## Breaking Changes\n\n- Dropped v1 routes\n",
                "abc",
            ),
            doc(
                ".kiro/specs/003-ui/completion/task-1.2-completion.md",
                "# Task 1.2 Completion\n\n## New Features\n\n- Dark mode\n",
                "",
            ),
            doc("notes/misc/task-9-summary.md", "Just a tidy-up.\n\nMore words.\n", ""),
        ];
        let paths: Vec<String> = docs.iter().map(|d| d.path.clone()).collect();
        let collector = Arc::new(FakeCollector::with(docs));

        let out = analyzer(collector).analyze_and_append(&paths, prior(2), "head").await;
        assert_eq!(out.appended, 3);
        let out = out.results;
        assert_eq!(out.len(), 5);
        assert_eq!(&out[..2], &prior(2)[..]);

        let major = &out[2];
        assert_eq!(major.impact_level, ImpactLevel::Major);
        assert_eq!(major.spec_name, "002-api");
        assert_eq!(major.task_number, "3");
        assert_eq!(major.release_note_content, "Reworked the API.");
        assert_eq!(major.analyzed_at_commit, "abc");

        let minor = &out[3];
        assert_eq!(minor.impact_level, ImpactLevel::Minor);
        assert_eq!(minor.spec_name, "003-ui");
        assert_eq!(minor.task_number, "1.2");
        assert_eq!(minor.release_note_content, "Task 1.2 Completion");
        assert_eq!(minor.analyzed_at_commit, "head");

        let patch = &out[4];
        assert_eq!(patch.impact_level, ImpactLevel::Patch);
        assert_eq!(patch.spec_name, "misc");
        assert_eq!(patch.release_note_content, "Just a tidy-up.");
    }

    #[tokio::test]
    async fn per_document_failures_are_dropped() {
        let docs = vec![
            doc("specs/a/task-1-summary.md", "# One\n", ""),
            doc("specs/a/task-2-summary.md", "# Two\n\nunparseable\n", ""),
        ];
        let collector = Arc::new(FakeCollector::with(docs));
        let analyzer = AppendOnlyAnalyzer::new(collector, Arc::new(PickyExtractor));
        let paths = vec![
            "specs/a/task-1-summary.md".to_string(),
            "specs/a/task-2-summary.md".to_string(),
            "specs/a/task-3-summary.md".to_string(),
        ];

        let out = analyzer.analyze_and_append(&paths, prior(1), "c").await;
        assert_eq!(out.appended, 1);
        assert!(out.collection_error.is_none());
        let out = out.results;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].file_path, "specs/a/task-1-summary.md");
    }

    #[tokio::test]
    async fn collection_failure_keeps_accumulated() {
        let collector = Arc::new(FakeCollector {
            fail: true,
            ..FakeCollector::default()
        });
        let accumulated = prior(4);
        let ptr = accumulated.as_ptr();
        let out = analyzer(collector.clone())
            .analyze_and_append(&["specs/a/task-1-summary.md".to_string()], accumulated, "c")
            .await;
        assert!(out.collection_error.as_deref().is_some_and(|e| e.contains("collector unavailable")));
        assert_eq!(out.appended, 0);
        let out = out.results;
        assert_eq!(out.as_ptr(), ptr);
        assert_eq!(out.len(), 4);
        assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
    }

    async fn fastest_run(analyzer: &AppendOnlyAnalyzer, paths: &[String], prior_count: usize) -> Duration {
        let mut fastest = Duration::MAX;
        for _ in 0..3 {
            let accumulated = prior(prior_count);
            let started = Instant::now();
            let out = analyzer.analyze_and_append(paths, accumulated, "c").await.results;
            fastest = fastest.min(started.elapsed());
            assert_eq!(out.len(), prior_count + 5);
        }
        fastest
    }

    #[tokio::test]
    async fn cost_does_not_scale_with_prior_corpus() {
        let docs: Vec<CompletionDocument> = (0..5)
            .map(|i| doc(&format!("specs/new/task-{i}-summary.md"), "# New\n", "c"))
            .collect();
        let paths: Vec<String> = docs.iter().map(|d| d.path.clone()).collect();
        let analyzer = AppendOnlyAnalyzer::new(Arc::new(FakeCollector::with(docs)), Arc::new(SlowExtractor));

        let small = fastest_run(&analyzer, &paths, 100).await;
        let large = fastest_run(&analyzer, &paths, 500).await;
        assert!(
            large.as_secs_f64() < small.as_secs_f64() * 3.0,
            "100 prior: {small:?}, 500 prior: {large:?}"
        );
    }

    #[test]
    fn release_note_prefers_sections_then_title_then_paragraph() {
        let overview = doc("a/task-1-summary.md", "# T\n\n## Overview\n\nThe overview.\n\n## Summary\n\n", "");
        assert_eq!(release_note_content(&overview), "The overview.");

        let details = doc(
            "a/task-1-summary.md",
            "# T\n\n## Implementation Details\n\nLine one\nLine two\n\n## Next\n",
            "",
        );
        assert_eq!(release_note_content(&details), "Line one\nLine two");

        let untitled = doc("a/task-1-summary.md", "## Notes\n\nFirst real paragraph.\n", "");
        assert_eq!(release_note_content(&untitled), "First real paragraph.");
    }
}
