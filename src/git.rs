//! Batched, cached, and concurrent git queries.
//!
//! Results are cached per region: `releases` (including "no release found"),
//! `changes` and `added` keyed by the resolved commit range, and `tags` for
//! enriched tag lookups. A cached value is always a whole result.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::caching::{CacheConfig, CacheStats, CachingStrategy};
use crate::monitor::{PerformanceMonitor, PerformanceReport};
use crate::vcs::VcsRunner;

static RELEASE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v?\d+\.\d+\.\d+(-[A-Za-z0-9.-]+)?$").expect("valid regex literal"));

const MAX_TAGS_PER_BATCH: usize = 50;
const PARALLEL_DIFF_THRESHOLD: usize = 100;
const DIFF_CHUNK_SIZE: usize = 50;
const LOG_FORMAT: &str = "--format=%x1e%H|%h|%an|%cI|%s";
const LAST_RELEASE_KEY: &str = "last-release";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub max_commits_per_batch: usize,
    /// Only consider tags reachable from HEAD.
    pub enable_shallow_clone: bool,
    pub use_git_cache: bool,
    pub parallel_file_processing: bool,
    pub max_concurrent_operations: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub cache_expiration: Duration,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            max_commits_per_batch: 100,
            enable_shallow_clone: false,
            use_git_cache: true,
            parallel_file_processing: true,
            max_concurrent_operations: 4,
            cache_expiration: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitTag {
    pub name: String,
    pub commit: String,
    pub date: DateTime<Utc>,
    /// Annotation body; empty for lightweight tags.
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCommit {
    pub hash: String,
    pub short_hash: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitChanges {
    pub commits: Vec<GitCommit>,
    pub added_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub deleted_files: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct GitPerformance {
    /// Milliseconds.
    pub duration: f64,
    pub cache_hit: bool,
    pub batch_count: usize,
    pub processed_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitOperationResult<T> {
    pub data: T,
    pub performance: GitPerformance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FileChange {
    Added(String),
    Modified(String),
    Deleted(String),
}

#[derive(Debug, Default, Clone, Copy)]
struct Work {
    cache_hit: bool,
    batch_count: usize,
    processed_items: usize,
}

impl Work {
    fn cached(processed_items: usize) -> Self {
        Self {
            cache_hit: true,
            batch_count: 0,
            processed_items,
        }
    }
}

struct GitCaches {
    releases: CachingStrategy<Option<GitTag>>,
    changes: CachingStrategy<GitChanges>,
    added: CachingStrategy<Vec<String>>,
    tags: CachingStrategy<GitTag>,
}

impl GitCaches {
    fn new(expiration: Duration) -> Self {
        let config = || CacheConfig {
            ttl: Some(expiration),
            ..CacheConfig::default()
        };
        Self {
            releases: CachingStrategy::with_config("releases", config()),
            changes: CachingStrategy::with_config("changes", config()),
            added: CachingStrategy::with_config("added", config()),
            tags: CachingStrategy::with_config("tags", config()),
        }
    }
}

pub struct GitPerformanceOptimizer {
    vcs: Arc<dyn VcsRunner>,
    config: GitConfig,
    monitor: PerformanceMonitor,
    caches: Mutex<GitCaches>,
}

impl GitPerformanceOptimizer {
    pub fn new(vcs: Arc<dyn VcsRunner>, config: GitConfig) -> Self {
        let caches = Mutex::new(GitCaches::new(config.cache_expiration));
        Self {
            vcs,
            config,
            monitor: PerformanceMonitor::new(),
            caches,
        }
    }

    pub fn config(&self) -> &GitConfig {
        &self.config
    }

    fn caches(&self) -> MutexGuard<'_, GitCaches> {
        self.caches.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        self.vcs.run(args).await
    }

    /// Peels tags so annotated tags resolve to their commit.
    async fn resolve(&self, reference: &str) -> Result<String> {
        let spec = format!("{reference}^{{commit}}");
        let out = self
            .git(&["rev-parse", &spec])
            .await
            .with_context(|| format!("Failed to resolve reference {reference}"))?;
        Ok(out.trim().to_string())
    }

    async fn measured<T>(
        &self,
        name: &str,
        work: impl Future<Output = Result<(T, Work)>>,
    ) -> Result<GitOperationResult<T>> {
        let (result, metric) = self.monitor.measure_result(name, work).await;
        let (data, work) = result?;
        Ok(GitOperationResult {
            data,
            performance: GitPerformance {
                duration: metric.duration,
                cache_hit: work.cache_hit,
                batch_count: work.batch_count,
                processed_items: work.processed_items,
            },
        })
    }

    pub async fn find_last_release_optimized(&self) -> Result<GitOperationResult<Option<GitTag>>> {
        self.measured("find_last_release", self.find_last_release_inner())
            .await
    }

    async fn find_last_release_inner(&self) -> Result<(Option<GitTag>, Work)> {
        if self.config.use_git_cache
            && let Some(cached) = self.caches().releases.get(LAST_RELEASE_KEY)
        {
            debug!(found = cached.is_some(), "last release served from cache");
            return Ok((cached, Work::cached(1)));
        }

        let mut args = vec!["tag", "-l", "--sort=-version:refname"];
        if self.config.enable_shallow_clone {
            args.extend(["--merged", "HEAD"]);
        }
        let listing = self.git(&args).await.context("Failed to list tags")?;
        let tags: Vec<&str> = listing.lines().map(str::trim).filter(|t| !t.is_empty()).collect();

        let batch_size = MAX_TAGS_PER_BATCH.min(self.config.max_commits_per_batch).max(1);
        let mut work = Work::default();
        let mut found = None;

        'batches: for batch in tags.chunks(batch_size) {
            work.batch_count += 1;
            for tag in batch {
                work.processed_items += 1;
                if !RELEASE_TAG_RE.is_match(tag) {
                    continue;
                }
                match self.tag_info(tag).await {
                    Ok(info) => {
                        found = Some(info);
                        break 'batches;
                    }
                    Err(err) => warn!(tag = %tag, error = %err, "skipping tag that could not be inspected"),
                }
            }
        }

        if self.config.use_git_cache {
            self.caches().releases.set(LAST_RELEASE_KEY, found.clone());
        }
        Ok((found, work))
    }

    async fn tag_info(&self, tag: &str) -> Result<GitTag> {
        if self.config.use_git_cache
            && let Some(cached) = self.caches().tags.get(tag)
        {
            return Ok(cached);
        }

        let commit_args = ["rev-list", "-n", "1", tag];
        let date_args = ["log", "-1", "--format=%cI", tag];
        let message_args = ["tag", "-l", "--format=%(contents)", tag];
        let (commit, date, message) = tokio::try_join!(
            self.git(&commit_args),
            self.git(&date_args),
            self.git(&message_args),
        )?;
        let info = GitTag {
            name: tag.to_string(),
            commit: commit.trim().to_string(),
            date: parse_git_date(date.trim())?,
            message: message.trim().to_string(),
        };

        if self.config.use_git_cache {
            self.caches().tags.set(tag, info.clone());
        }
        Ok(info)
    }

    pub async fn get_changes_since_optimized(&self, reference: &str) -> Result<GitOperationResult<GitChanges>> {
        self.measured("get_changes_since", self.changes_since_inner(reference))
            .await
    }

    async fn changes_since_inner(&self, reference: &str) -> Result<(GitChanges, Work)> {
        let (head, from) = tokio::try_join!(self.resolve("HEAD"), self.resolve(reference))?;
        let range = format!("{from}..{head}");

        if self.config.use_git_cache
            && let Some(cached) = self.caches().changes.get(&range)
        {
            let items = cached.commits.len();
            return Ok((cached, Work::cached(items)));
        }

        let ((commits, batch_count), files) =
            tokio::try_join!(self.commits_in_range(&range), self.file_changes(&from, &head))?;

        let mut changes = GitChanges {
            commits,
            ..GitChanges::default()
        };
        for change in files {
            match change {
                FileChange::Added(path) => changes.added_files.push(path),
                FileChange::Modified(path) => changes.modified_files.push(path),
                FileChange::Deleted(path) => changes.deleted_files.push(path),
            }
        }

        let processed_items = changes.commits.len()
            + changes.added_files.len()
            + changes.modified_files.len()
            + changes.deleted_files.len();
        debug!(range = %range, commits = changes.commits.len(), files = processed_items - changes.commits.len(), "collected changes");

        if self.config.use_git_cache {
            self.caches().changes.set(range, changes.clone());
        }
        Ok((
            changes,
            Work {
                cache_hit: false,
                batch_count,
                processed_items,
            },
        ))
    }

    /// Files added between `reference` and HEAD.
    pub async fn added_files_since(&self, reference: &str) -> Result<Vec<String>> {
        let (head, from) = tokio::try_join!(self.resolve("HEAD"), self.resolve(reference))?;
        let range = format!("{from}..{head}");

        if self.config.use_git_cache
            && let Some(cached) = self.caches().added.get(&range)
        {
            return Ok(cached);
        }

        let added: Vec<String> = self
            .file_changes(&from, &head)
            .await?
            .into_iter()
            .filter_map(|change| match change {
                FileChange::Added(path) => Some(path),
                _ => None,
            })
            .collect();

        if self.config.use_git_cache {
            self.caches().added.set(range, added.clone());
        }
        Ok(added)
    }

    /// Pages through the log strictly in order. Returns the commits and the
    /// number of pages fetched.
    async fn commits_in_range(&self, range: &str) -> Result<(Vec<GitCommit>, usize)> {
        let count: usize = self
            .git(&["rev-list", "--count", range])
            .await?
            .trim()
            .parse()
            .context("Unexpected rev-list --count output")?;

        let page = self.config.max_commits_per_batch.max(1);
        let mut commits = Vec::with_capacity(count);
        let mut batches = 0;
        let mut skip = 0;
        while skip < count {
            let skip_arg = format!("--skip={skip}");
            let max_arg = format!("--max-count={page}");
            let out = self
                .git(&["log", LOG_FORMAT, "--name-only", &skip_arg, &max_arg, range])
                .await?;
            commits.extend(parse_log(&out)?);
            batches += 1;
            skip += page;
        }
        Ok((commits, batches))
    }

    async fn file_changes(&self, from: &str, to: &str) -> Result<Vec<FileChange>> {
        let out = self.git(&["diff", "--name-status", from, to]).await?;
        let lines: Vec<&str> = out.lines().filter(|l| !l.trim().is_empty()).collect();

        if self.config.parallel_file_processing && lines.len() > PARALLEL_DIFF_THRESHOLD {
            let chunks: Vec<Vec<FileChange>> = lines
                .par_chunks(DIFF_CHUNK_SIZE)
                .map(|chunk| chunk.iter().filter_map(|l| parse_name_status(l)).collect())
                .collect();
            return Ok(chunks.into_iter().flatten().collect());
        }
        Ok(lines.iter().filter_map(|l| parse_name_status(l)).collect())
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.monitor.generate_report()
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        let caches = self.caches();
        vec![
            caches.releases.stats(),
            caches.changes.stats(),
            caches.added.stats(),
            caches.tags.stats(),
        ]
    }

    pub fn reset(&self) {
        self.monitor.clear();
        let mut caches = self.caches();
        caches.releases.invalidate_all();
        caches.changes.invalidate_all();
        caches.added.invalidate_all();
        caches.tags.invalidate_all();
    }

    /// Drops entries older than `cache_expiration`.
    pub fn prune_caches(&self) -> usize {
        let max_age = self.config.cache_expiration;
        let mut caches = self.caches();
        caches.releases.prune_old_entries(max_age)
            + caches.changes.prune_old_entries(max_age)
            + caches.added.prune_old_entries(max_age)
            + caches.tags.prune_old_entries(max_age)
    }
}

fn parse_git_date(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw).with_context(|| format!("Invalid git date: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Records start with 0x1e; the header is `hash|short|author|date|subject`
/// and the remaining lines are touched paths.
fn parse_log(out: &str) -> Result<Vec<GitCommit>> {
    let mut commits = Vec::new();
    for record in out.split('\x1e') {
        let mut lines = record.lines();
        let Some(header) = lines.next().filter(|h| !h.trim().is_empty()) else {
            continue;
        };
        let fields: Vec<&str> = header.splitn(5, '|').collect();
        let [hash, short_hash, author, date, message] = fields[..] else {
            warn!(header = %header, "skipping malformed log record");
            continue;
        };
        commits.push(GitCommit {
            hash: hash.to_string(),
            short_hash: short_hash.to_string(),
            author: author.to_string(),
            date: parse_git_date(date)?,
            message: message.to_string(),
            files: lines
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        });
    }
    Ok(commits)
}

fn parse_name_status(line: &str) -> Option<FileChange> {
    let mut parts = line.split('\t');
    let status = parts.next()?.trim();
    let paths: Vec<&str> = parts.collect();
    // Renames and copies list old then new.
    let path = paths.last()?.to_string();
    match status.chars().next()? {
        'A' => Some(FileChange::Added(path)),
        'M' | 'R' | 'C' => Some(FileChange::Modified(path)),
        'D' => Some(FileChange::Deleted(path)),
        _ => None,
    }
}
