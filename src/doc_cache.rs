//! Per-file parse cache for completion documents.
//!
//! An entry stays valid only while the file's mtime is unchanged, the entry
//! has been accessed within `max_cache_age`, and (when content hashing is
//! enabled) the SHA-256 of the current content still matches. Checks run
//! cheapest first; the first failure drops that one entry.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::caching::now_millis;
use crate::document::{CompletionDocument, extract_document_metadata, hash_content};
use crate::error::ReleaseImpactError;
use crate::vcs::VcsRunner;

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DocumentCacheConfig {
    pub enable_cache: bool,
    pub max_cache_size: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub max_cache_age: Duration,
    pub enable_incremental_parsing: bool,
    pub enable_content_hashing: bool,
    pub enable_parallel_parsing: bool,
    pub max_concurrent_parsing: usize,
}

impl Default for DocumentCacheConfig {
    fn default() -> Self {
        Self {
            enable_cache: true,
            max_cache_size: 1000,
            max_cache_age: Duration::from_secs(60 * 60),
            enable_incremental_parsing: true,
            enable_content_hashing: true,
            enable_parallel_parsing: true,
            max_concurrent_parsing: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParsedDocumentCacheEntry {
    pub document: CompletionDocument,
    pub content_hash: String,
    pub file_size: u64,
    /// File mtime in milliseconds since the Unix epoch.
    pub last_modified: u64,
    /// Milliseconds spent parsing.
    pub parse_time: f64,
    pub access_count: u64,
    pub last_accessed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IncrementalParsingResult {
    pub document: CompletionDocument,
    pub from_cache: bool,
    pub parse_time: f64,
    pub content_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseProgress {
    pub completed: usize,
    pub total: usize,
    pub current_file: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentCacheStats {
    pub total_documents: u64,
    pub cached_documents: usize,
    pub cache_hit_rate: f64,
    pub total_parse_time: f64,
    pub average_parse_time: f64,
    pub cache_size_bytes: u64,
    pub oldest_entry: Option<u64>,
    pub newest_entry: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MostAccessedDocument {
    pub path: String,
    pub access_count: u64,
    pub parse_time: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    total_parse_time: f64,
    documents_processed: u64,
}

#[derive(Debug, Clone, Copy)]
struct FileState {
    size: u64,
    mtime: u64,
    modified: SystemTime,
}

pub struct DocumentParsingCache {
    working_dir: PathBuf,
    config: DocumentCacheConfig,
    vcs: Option<Arc<dyn VcsRunner>>,
    entries: Mutex<HashMap<String, ParsedDocumentCacheEntry>>,
    counters: Mutex<Counters>,
}

impl DocumentParsingCache {
    pub fn new(working_dir: impl Into<PathBuf>, config: DocumentCacheConfig) -> Self {
        Self {
            working_dir: working_dir.into(),
            config,
            vcs: None,
            entries: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Attaches a VCS runner used to look up each document's last commit.
    pub fn with_vcs(mut self, vcs: Arc<dyn VcsRunner>) -> Self {
        self.vcs = Some(vcs);
        self
    }

    pub fn config(&self) -> &DocumentCacheConfig {
        &self.config
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, ParsedDocumentCacheEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn full_path(&self, file_path: &str) -> PathBuf {
        self.working_dir.join(file_path)
    }

    pub async fn parse_document_incremental(&self, file_path: &str) -> Result<IncrementalParsingResult> {
        let started = Instant::now();
        self.counters().total_requests += 1;

        let state = file_state(&self.full_path(file_path))
            .await
            .map_err(|e| read_error(file_path, e))?;

        if self.config.enable_cache
            && self.config.enable_incremental_parsing
            && let Some(document) = self.cached_document(file_path, state).await
        {
            self.counters().cache_hits += 1;
            debug!(path = %file_path, "document cache hit");
            return Ok(IncrementalParsingResult {
                document,
                from_cache: true,
                parse_time: elapsed_ms(started),
                content_changed: false,
            });
        }

        self.counters().cache_misses += 1;
        let document = self.parse_document_fresh(file_path, state).await?;
        let parse_time = elapsed_ms(started);
        {
            let mut counters = self.counters();
            counters.total_parse_time += parse_time;
            counters.documents_processed += 1;
        }

        if self.config.enable_cache {
            self.cache_document(file_path, &document, state, parse_time);
        }

        Ok(IncrementalParsingResult {
            document,
            from_cache: false,
            parse_time,
            content_changed: true,
        })
    }

    /// Parses `file_paths`, dropping documents that fail. Small inputs run
    /// sequentially; larger ones run in fixed batches of
    /// `max_concurrent_parsing`, each joined before the next starts.
    pub async fn parse_documents_parallel(
        &self,
        file_paths: &[String],
        on_progress: Option<&(dyn Fn(ParseProgress) + Send + Sync)>,
    ) -> Vec<IncrementalParsingResult> {
        let total = file_paths.len();
        let report = |completed: usize, current_file: &str| {
            if let Some(cb) = on_progress {
                cb(ParseProgress {
                    completed,
                    total,
                    current_file: current_file.to_string(),
                });
            }
        };

        let mut results = Vec::with_capacity(total);
        let batch_size = self.config.max_concurrent_parsing.max(1);

        if !self.config.enable_parallel_parsing || total <= batch_size {
            for (i, path) in file_paths.iter().enumerate() {
                report(i, path);
                match self.parse_document_incremental(path).await {
                    Ok(result) => results.push(result),
                    Err(err) => warn!(path = %path, error = %err, "failed to parse document"),
                }
            }
        } else {
            for (batch_index, batch) in file_paths.chunks(batch_size).enumerate() {
                let start = batch_index * batch_size;
                let futures = batch.iter().enumerate().map(|(i, path)| {
                    report(start + i, path);
                    async move { (path, self.parse_document_incremental(path).await) }
                });
                for (path, outcome) in futures::future::join_all(futures).await {
                    match outcome {
                        Ok(result) => results.push(result),
                        Err(err) => warn!(path = %path, error = %err, "failed to parse document"),
                    }
                }
            }
        }

        report(total, "");
        results
    }

    /// Runs the validity checks without touching the entry. Any I/O failure
    /// answers `true`.
    pub async fn needs_reparsing(&self, file_path: &str) -> bool {
        if !self.config.enable_cache || !self.config.enable_incremental_parsing {
            return true;
        }

        let full_path = self.full_path(file_path);
        let Ok(state) = file_state(&full_path).await else {
            return true;
        };

        let cached_hash = {
            let entries = self.entries();
            let Some(entry) = entries.get(file_path) else {
                return true;
            };
            if entry.last_modified != state.mtime || self.is_stale(entry) {
                return true;
            }
            entry.content_hash.clone()
        };

        if self.config.enable_content_hashing {
            return match tokio::fs::read_to_string(&full_path).await {
                Ok(content) => hash_content(&content) != cached_hash,
                Err(_) => true,
            };
        }
        false
    }

    fn is_stale(&self, entry: &ParsedDocumentCacheEntry) -> bool {
        let max_age = u64::try_from(self.config.max_cache_age.as_millis()).unwrap_or(u64::MAX);
        now_millis().saturating_sub(entry.last_accessed) > max_age
    }

    async fn cached_document(&self, file_path: &str, state: FileState) -> Option<CompletionDocument> {
        let cached_hash = {
            let mut entries = self.entries();
            let entry = entries.get(file_path)?;
            if entry.last_modified != state.mtime || self.is_stale(entry) {
                entries.remove(file_path);
                return None;
            }
            entry.content_hash.clone()
        };

        if self.config.enable_content_hashing {
            let matches = match tokio::fs::read_to_string(self.full_path(file_path)).await {
                Ok(content) => hash_content(&content) == cached_hash,
                Err(_) => false,
            };
            if !matches {
                self.entries().remove(file_path);
                return None;
            }
        }

        let mut entries = self.entries();
        let entry = entries.get_mut(file_path)?;
        entry.access_count += 1;
        entry.last_accessed = now_millis();
        Some(entry.document.clone())
    }

    async fn parse_document_fresh(&self, file_path: &str, state: FileState) -> Result<CompletionDocument> {
        let content = tokio::fs::read_to_string(self.full_path(file_path))
            .await
            .map_err(|e| read_error(file_path, e))?;

        let git_commit = match self.vcs.as_ref() {
            Some(vcs) => vcs
                .run(&["log", "-1", "--format=%H", "--", file_path])
                .await
                .map(|out| out.trim().to_string())
                .unwrap_or_default(),
            None => String::new(),
        };

        let metadata = extract_document_metadata(&content, file_path);
        Ok(CompletionDocument {
            path: file_path.to_string(),
            content,
            last_modified: DateTime::<Utc>::from(state.modified),
            git_commit,
            metadata,
        })
    }

    fn cache_document(&self, file_path: &str, document: &CompletionDocument, state: FileState, parse_time: f64) {
        let mut entries = self.entries();
        if entries.len() >= self.config.max_cache_size && !entries.contains_key(file_path) {
            evict_least_recently_used(&mut entries);
        }

        let content_hash = if self.config.enable_content_hashing {
            hash_content(&document.content)
        } else {
            String::new()
        };
        entries.insert(
            file_path.to_string(),
            ParsedDocumentCacheEntry {
                document: document.clone(),
                content_hash,
                file_size: state.size,
                last_modified: state.mtime,
                parse_time,
                access_count: 1,
                last_accessed: now_millis(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn contains(&self, file_path: &str) -> bool {
        self.entries().contains_key(file_path)
    }

    pub fn stats(&self) -> DocumentCacheStats {
        let counters = *self.counters();
        let entries = self.entries();

        let total_parse_time: f64 = entries.values().map(|e| e.parse_time).sum();
        let average_parse_time = if entries.is_empty() {
            0.0
        } else {
            total_parse_time / entries.len() as f64
        };
        let requests = counters.cache_hits + counters.cache_misses;
        DocumentCacheStats {
            total_documents: counters.documents_processed,
            cached_documents: entries.len(),
            cache_hit_rate: if requests > 0 {
                counters.cache_hits as f64 / requests as f64
            } else {
                0.0
            },
            total_parse_time: counters.total_parse_time,
            average_parse_time,
            cache_size_bytes: entries.values().map(|e| e.file_size).sum(),
            oldest_entry: entries.values().map(|e| e.last_accessed).min(),
            newest_entry: entries.values().map(|e| e.last_accessed).max(),
        }
    }

    pub fn most_accessed(&self, limit: usize) -> Vec<MostAccessedDocument> {
        let mut docs: Vec<MostAccessedDocument> = self
            .entries()
            .iter()
            .map(|(path, e)| MostAccessedDocument {
                path: path.clone(),
                access_count: e.access_count,
                parse_time: e.parse_time,
            })
            .collect();
        docs.sort_by(|a, b| {
            b.access_count
                .cmp(&a.access_count)
                .then_with(|| a.path.cmp(&b.path))
        });
        docs.truncate(limit);
        docs
    }

    pub fn prune_old_entries(&self) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, e| !self.is_stale(e));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
        *self.counters() = Counters::default();
    }

    pub async fn preload(&self, file_paths: &[String]) -> usize {
        let loaded = self.parse_documents_parallel(file_paths, None).await.len();
        debug!(count = loaded, "preloaded documents into cache");
        loaded
    }
}

/// Drops the oldest 25% by last access in one pass.
fn evict_least_recently_used(entries: &mut HashMap<String, ParsedDocumentCacheEntry>) {
    let mut by_access: Vec<(u64, String)> = entries
        .iter()
        .map(|(k, e)| (e.last_accessed, k.clone()))
        .collect();
    by_access.sort();

    let to_remove = entries.len().div_ceil(4);
    for (_, key) in by_access.into_iter().take(to_remove) {
        entries.remove(&key);
    }
}

async fn file_state(path: &Path) -> std::io::Result<FileState> {
    let meta = tokio::fs::metadata(path).await?;
    let modified = meta.modified()?;
    let mtime = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    Ok(FileState {
        size: meta.len(),
        mtime: u64::try_from(mtime).unwrap_or(u64::MAX),
        modified,
    })
}

fn read_error(file_path: &str, err: std::io::Error) -> anyhow::Error {
    ReleaseImpactError::DocumentRead {
        path: file_path.to_string(),
        reason: err.to_string(),
    }
    .into()
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
