use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::doc_cache::DocumentParsingCache;
use crate::document::CompletionDocument;
use crate::error::ReleaseImpactError;
use crate::parallel::{ParallelConfig, ParallelProcessor, ParallelTask, TaskFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CollectionErrorKind {
    NotFound,
    Empty,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionError {
    pub file_path: String,
    pub error: String,
    pub kind: CollectionErrorKind,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentCollectionResult {
    pub documents: Vec<CompletionDocument>,
    pub errors: Vec<CollectionError>,
    pub warnings: Vec<String>,
}

/// Loads completion documents by path. An `Err` means the whole collection
/// could not run; per-document problems go in `errors`.
#[async_trait]
pub trait DocumentCollector: Send + Sync {
    async fn collect_from_paths(&self, paths: &[String]) -> Result<DocumentCollectionResult>;
}

/// Reads documents through a shared parse cache, scheduled on a
/// [`ParallelProcessor`]. Documents come back in the order requested.
pub struct CompletionDocumentCollector {
    cache: Arc<DocumentParsingCache>,
    processor: Arc<ParallelProcessor>,
}

type Loaded = std::result::Result<CompletionDocument, CollectionError>;

impl CompletionDocumentCollector {
    pub fn new(cache: Arc<DocumentParsingCache>, config: ParallelConfig) -> Self {
        Self {
            cache,
            processor: Arc::new(ParallelProcessor::new(config)),
        }
    }

    pub fn cache(&self) -> &Arc<DocumentParsingCache> {
        &self.cache
    }

    pub fn processor(&self) -> &Arc<ParallelProcessor> {
        &self.processor
    }

    fn loader(&self) -> TaskFn<String, Loaded> {
        let cache = self.cache.clone();
        Arc::new(move |path: String| {
            let cache = cache.clone();
            Box::pin(async move { load_document(&cache, path).await })
        })
    }
}

/// Missing and empty files are reported without retrying. Other read
/// failures return `Err` so the processor retries them.
async fn load_document(cache: &DocumentParsingCache, path: String) -> Result<Loaded> {
    let full_path = cache.working_dir().join(&path);
    if !tokio::fs::try_exists(&full_path).await.unwrap_or(false) {
        return Ok(Err(CollectionError {
            error: format!("File not found: {path}"),
            file_path: path,
            kind: CollectionErrorKind::NotFound,
            recoverable: false,
        }));
    }

    let parsed = cache.parse_document_incremental(&path).await?;
    if parsed.document.content.trim().is_empty() {
        return Ok(Err(CollectionError {
            error: format!("Document is empty: {path}"),
            file_path: path,
            kind: CollectionErrorKind::Empty,
            recoverable: false,
        }));
    }
    Ok(Ok(parsed.document))
}

#[async_trait]
impl DocumentCollector for CompletionDocumentCollector {
    async fn collect_from_paths(&self, paths: &[String]) -> Result<DocumentCollectionResult> {
        if self.processor.is_cancelled() {
            return Err(ReleaseImpactError::Cancelled.into());
        }

        let loader = self.loader();
        let tasks = paths
            .iter()
            .map(|path| ParallelTask::with_processor(path.clone(), path.clone(), loader.clone()))
            .collect();
        let task_results = self.processor.process_all(tasks, None).await;

        if self.processor.is_cancelled() {
            return Err(ReleaseImpactError::Cancelled.into());
        }

        let index_of = |task_id: &str| paths.iter().position(|p| p == task_id).unwrap_or(usize::MAX);
        let mut loaded = Vec::with_capacity(task_results.len());
        let mut result = DocumentCollectionResult::default();

        for task in task_results {
            match task.outcome {
                Ok(Ok(document)) => loaded.push(document),
                Ok(Err(error)) => {
                    warn!(path = %error.file_path, kind = ?error.kind, "document not collected");
                    result.errors.push(error);
                }
                Err(message) => {
                    warn!(path = %task.task_id, error = %message, retries = task.retry_count, "document read failed");
                    result.errors.push(CollectionError {
                        file_path: task.task_id,
                        error: message,
                        kind: CollectionErrorKind::Read,
                        recoverable: true,
                    });
                }
            }
        }

        loaded.sort_by_key(|doc| index_of(&doc.path));
        for doc in &loaded {
            if doc.metadata.title.is_empty() {
                result.warnings.push(format!("Document has no title: {}", doc.path));
            }
        }
        debug!(
            requested = paths.len(),
            collected = loaded.len(),
            errors = result.errors.len(),
            "collected documents"
        );
        result.documents = loaded;
        Ok(result)
    }
}
