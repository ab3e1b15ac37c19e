//! Bounded-concurrency task runner.
//!
//! Tasks run highest priority first, in sequential batches of `batch_size`.
//! Inside a batch a semaphore admits at most `max_concurrency` attempts at a
//! time. A failing task retries in place with linear backoff and gives its
//! permit back while it waits.

use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::error::ReleaseImpactError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    #[serde(with = "crate::config::duration_ms")]
    pub retry_delay: Duration,
    pub enable_progress_reporting: bool,
    #[serde(with = "crate::config::duration_ms")]
    pub progress_interval: Duration,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            batch_size: 10,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            enable_progress_reporting: true,
            progress_interval: Duration::from_millis(250),
        }
    }
}

pub type TaskFn<I, O> = Arc<dyn Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync>;

pub struct ParallelTask<I, O> {
    pub id: String,
    pub input: I,
    /// Higher runs first.
    pub priority: i32,
    pub processor: TaskFn<I, O>,
}

impl<I, O> ParallelTask<I, O> {
    pub fn new<F, Fut>(id: impl Into<String>, input: I, processor: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        Self {
            id: id.into(),
            input,
            priority: 0,
            processor: Arc::new(move |input| Box::pin(processor(input))),
        }
    }

    /// Shares one processor between many tasks.
    pub fn with_processor(id: impl Into<String>, input: I, processor: TaskFn<I, O>) -> Self {
        Self {
            id: id.into(),
            input,
            priority: 0,
            processor,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TaskResult<O> {
    pub task_id: String,
    pub outcome: Result<O, String>,
    /// Milliseconds, across all attempts and backoff.
    pub processing_time: f64,
    pub retry_count: u32,
}

impl<O> TaskResult<O> {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct BatchResult<O> {
    pub results: Vec<TaskResult<O>>,
    pub success_count: usize,
    pub error_count: usize,
    pub average_processing_time: f64,
}

impl<O> BatchResult<O> {
    fn from_results(results: Vec<TaskResult<O>>) -> Self {
        let success_count = results.iter().filter(|r| r.success()).count();
        let error_count = results.len() - success_count;
        let average_processing_time = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|r| r.processing_time).sum::<f64>() / results.len() as f64
        };
        Self {
            results,
            success_count,
            error_count,
            average_processing_time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
    pub errors: usize,
    pub retries: u64,
    /// Tasks per second.
    pub throughput: f64,
    /// Milliseconds.
    pub estimated_remaining: f64,
}

pub type ProgressCallback<'a> = &'a (dyn Fn(ProgressUpdate) + Send + Sync);

#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub active_tasks: Arc<AtomicUsize>,
    pub peak_concurrency: Arc<AtomicUsize>,
    pub completed_tasks: Arc<AtomicU64>,
    pub failed_tasks: Arc<AtomicU64>,
    pub retries: Arc<AtomicU64>,
}

impl ProcessorStats {
    fn new() -> Self {
        Self {
            active_tasks: Arc::new(AtomicUsize::new(0)),
            peak_concurrency: Arc::new(AtomicUsize::new(0)),
            completed_tasks: Arc::new(AtomicU64::new(0)),
            failed_tasks: Arc::new(AtomicU64::new(0)),
            retries: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    total: usize,
    completed: usize,
    errors: usize,
    retries: u64,
    started: Option<Instant>,
    last_emit: Option<Instant>,
}

impl ProgressState {
    fn snapshot(&self) -> ProgressUpdate {
        let elapsed = self.started.map(|s| s.elapsed().as_secs_f64()).unwrap_or_default();
        let throughput = if elapsed > 0.0 {
            self.completed as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(self.completed);
        ProgressUpdate {
            completed: self.completed,
            total: self.total,
            percentage: if self.total == 0 {
                100.0
            } else {
                self.completed as f64 * 100.0 / self.total as f64
            },
            errors: self.errors,
            retries: self.retries,
            throughput,
            estimated_remaining: if throughput > 0.0 {
                remaining as f64 / throughput * 1000.0
            } else {
                0.0
            },
        }
    }
}

/// Decrements the active count when an attempt ends, however it ends.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a ProcessorStats) -> Self {
        let now = stats.active_tasks.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        stats.peak_concurrency.fetch_max(now, AtomicOrdering::SeqCst);
        Self(&stats.active_tasks)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::SeqCst);
    }
}

pub struct ParallelProcessor {
    config: ParallelConfig,
    cancelled: Arc<AtomicBool>,
    stats: ProcessorStats,
    progress: Mutex<ProgressState>,
}

impl ParallelProcessor {
    pub fn new(config: ParallelConfig) -> Self {
        Self {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
            stats: ProcessorStats::new(),
            progress: Mutex::new(ProgressState::default()),
        }
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats.clone()
    }

    fn progress(&self) -> MutexGuard<'_, ProgressState> {
        self.progress.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stops new attempts and new batches. Work already running finishes.
    /// The flag stays set until `reset()`.
    pub fn cancel(&self) {
        self.cancelled.store(true, AtomicOrdering::SeqCst);
        *self.progress() = ProgressState::default();
        info!("parallel processing cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, AtomicOrdering::SeqCst);
        *self.progress() = ProgressState::default();
        self.stats.peak_concurrency.store(0, AtomicOrdering::SeqCst);
        self.stats.completed_tasks.store(0, AtomicOrdering::SeqCst);
        self.stats.failed_tasks.store(0, AtomicOrdering::SeqCst);
        self.stats.retries.store(0, AtomicOrdering::SeqCst);
    }

    /// Runs every task and returns the results of all batches that started,
    /// completion-ordered within each batch.
    pub async fn process_all<I, O>(
        &self,
        mut tasks: Vec<ParallelTask<I, O>>,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Vec<TaskResult<O>>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
    {
        // Stable: equal priorities keep submission order.
        tasks.sort_by(|a, b| b.priority.cmp(&a.priority));

        {
            let mut progress = self.progress();
            *progress = ProgressState {
                total: tasks.len(),
                started: Some(Instant::now()),
                ..ProgressState::default()
            };
        }

        let batch_size = self.config.batch_size.max(1);
        let mut results = Vec::with_capacity(tasks.len());
        let mut remaining = tasks.into_iter().peekable();
        let mut batch_index = 0;

        while remaining.peek().is_some() {
            if self.is_cancelled() {
                debug!(batch = batch_index, "skipping remaining batches after cancellation");
                break;
            }
            let batch: Vec<_> = remaining.by_ref().take(batch_size).collect();
            let outcome = self.process_batch(batch, on_progress).await;
            debug!(
                batch = batch_index,
                succeeded = outcome.success_count,
                failed = outcome.error_count,
                "batch finished"
            );
            results.extend(outcome.results);
            batch_index += 1;
        }

        if self.config.enable_progress_reporting
            && !self.is_cancelled()
            && let Some(cb) = on_progress
        {
            let mut progress = self.progress();
            progress.completed = progress.total;
            progress.last_emit = Some(Instant::now());
            cb(progress.snapshot());
        }
        results
    }

    pub async fn process_batch<I, O>(
        &self,
        tasks: Vec<ParallelTask<I, O>>,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> BatchResult<O>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
    {
        let semaphore = Semaphore::new(self.config.max_concurrency.max(1));
        let mut running: FuturesUnordered<_> = tasks
            .into_iter()
            .map(|task| self.run_task(task, &semaphore))
            .collect();

        let mut results = Vec::new();
        while let Some(result) = running.next().await {
            self.record(&result, on_progress);
            results.push(result);
        }
        BatchResult::from_results(results)
    }

    async fn run_task<I, O>(&self, task: ParallelTask<I, O>, semaphore: &Semaphore) -> TaskResult<O>
    where
        I: Clone + Send + 'static,
        O: Send + 'static,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let outcome = loop {
            if self.is_cancelled() {
                break Err(ReleaseImpactError::Cancelled.to_string());
            }

            let result = {
                let Ok(_permit) = semaphore.acquire().await else {
                    break Err(ReleaseImpactError::Cancelled.to_string());
                };
                let _active = ActiveGuard::enter(&self.stats);
                (task.processor)(task.input.clone()).await
            };

            match result {
                Ok(value) => break Ok(value),
                Err(err) if attempt < self.config.max_retries => {
                    attempt += 1;
                    self.stats.retries.fetch_add(1, AtomicOrdering::Relaxed);
                    self.progress().retries += 1;
                    debug!(task = %task.id, attempt, error = %err, "retrying task");
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
                Err(err) => break Err(format!("{err:#}")),
            }
        };

        TaskResult {
            task_id: task.id,
            outcome,
            processing_time: started.elapsed().as_secs_f64() * 1000.0,
            retry_count: attempt,
        }
    }

    fn record<O>(&self, result: &TaskResult<O>, on_progress: Option<ProgressCallback<'_>>) {
        if result.success() {
            self.stats.completed_tasks.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.stats.failed_tasks.fetch_add(1, AtomicOrdering::Relaxed);
        }

        let mut progress = self.progress();
        progress.completed += 1;
        if !result.success() {
            progress.errors += 1;
        }

        if !self.config.enable_progress_reporting {
            return;
        }
        let Some(cb) = on_progress else {
            return;
        };
        let due = progress
            .last_emit
            .is_none_or(|last| last.elapsed() >= self.config.progress_interval);
        if due && progress.completed < progress.total {
            progress.last_emit = Some(Instant::now());
            cb(progress.snapshot());
        }
    }
}
