//! Named-operation timing.
//!
//! Metrics accumulate until `clear()`; long-lived callers should clear
//! periodically.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use crate::caching::now_millis;

pub type Metadata = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceMetric {
    pub operation: String,
    /// Milliseconds since the Unix epoch.
    pub start_time: f64,
    pub end_time: f64,
    /// Milliseconds; always `end_time - start_time`.
    pub duration: f64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_operations: usize,
    pub total_duration: f64,
    pub average_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub metrics: Vec<PerformanceMetric>,
}

#[derive(Debug, Clone, Copy)]
struct OpenOperation {
    started: Instant,
    start_time: f64,
}

#[derive(Debug, Default)]
struct MonitorState {
    open: HashMap<String, Vec<OpenOperation>>,
    metrics: Vec<PerformanceMetric>,
}

#[derive(Debug, Default)]
pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
}

impl PerformanceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start_operation(&self, name: &str) {
        let open = OpenOperation {
            started: Instant::now(),
            start_time: now_millis() as f64,
        };
        self.lock().open.entry(name.to_string()).or_default().push(open);
    }

    /// Closes the most recent open start for `name`. Returns `None` when no
    /// start is pending.
    pub fn end_operation(&self, name: &str, metadata: Option<Metadata>) -> Option<PerformanceMetric> {
        let mut state = self.lock();
        let open = state.open.get_mut(name)?.pop()?;
        if state.open.get(name).is_some_and(Vec::is_empty) {
            state.open.remove(name);
        }

        let metric = finish(name, open, metadata.unwrap_or_default());
        state.metrics.push(metric.clone());
        Some(metric)
    }

    /// Times a future. The metric is recorded whatever the future resolves
    /// to.
    pub async fn measure<F, T>(&self, name: &str, work: F) -> (T, PerformanceMetric)
    where
        F: Future<Output = T>,
    {
        let open = OpenOperation {
            started: Instant::now(),
            start_time: now_millis() as f64,
        };
        let result = work.await;
        let metric = finish(name, open, Metadata::new());
        self.lock().metrics.push(metric.clone());
        (result, metric)
    }

    /// Like `measure`, for fallible work. The metric carries a `success`
    /// flag and the error is handed back untouched.
    pub async fn measure_result<F, T, E>(&self, name: &str, work: F) -> (Result<T, E>, PerformanceMetric)
    where
        F: Future<Output = Result<T, E>>,
    {
        let open = OpenOperation {
            started: Instant::now(),
            start_time: now_millis() as f64,
        };
        let result = work.await;
        let mut metadata = Metadata::new();
        metadata.insert("success".to_string(), Value::Bool(result.is_ok()));
        let metric = finish(name, open, metadata);
        self.lock().metrics.push(metric.clone());
        (result, metric)
    }

    pub fn measure_sync<F, T>(&self, name: &str, work: F) -> (T, PerformanceMetric)
    where
        F: FnOnce() -> T,
    {
        let open = OpenOperation {
            started: Instant::now(),
            start_time: now_millis() as f64,
        };
        let result = work();
        let metric = finish(name, open, Metadata::new());
        self.lock().metrics.push(metric.clone());
        (result, metric)
    }

    pub fn metrics(&self) -> Vec<PerformanceMetric> {
        self.lock().metrics.clone()
    }

    pub fn generate_report(&self) -> PerformanceReport {
        let metrics = self.metrics();
        if metrics.is_empty() {
            return PerformanceReport::default();
        }

        let total_duration: f64 = metrics.iter().map(|m| m.duration).sum();
        let min_duration = metrics.iter().map(|m| m.duration).fold(f64::INFINITY, f64::min);
        let max_duration = metrics.iter().map(|m| m.duration).fold(0.0, f64::max);
        PerformanceReport {
            total_operations: metrics.len(),
            total_duration,
            average_duration: total_duration / metrics.len() as f64,
            min_duration,
            max_duration,
            metrics,
        }
    }

    pub fn slow_operations(&self, threshold_ms: f64) -> Vec<PerformanceMetric> {
        self.lock()
            .metrics
            .iter()
            .filter(|m| m.duration > threshold_ms)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.open.clear();
        state.metrics.clear();
    }
}

fn finish(name: &str, open: OpenOperation, metadata: Metadata) -> PerformanceMetric {
    let end_time = open.start_time + open.started.elapsed().as_secs_f64() * 1000.0;
    PerformanceMetric {
        operation: name.to_string(),
        start_time: open.start_time,
        end_time,
        duration: end_time - open.start_time,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn end_without_start_returns_none() {
        let monitor = PerformanceMonitor::new();
        assert!(monitor.end_operation("never-started", None).is_none());
        assert!(monitor.metrics().is_empty());
    }

    #[test]
    fn end_closes_most_recent_start() {
        let monitor = PerformanceMonitor::new();
        monitor.start_operation("scan");
        std::thread::sleep(Duration::from_millis(12));
        monitor.start_operation("scan");

        let inner = monitor.end_operation("scan", None).unwrap();
        let outer = monitor.end_operation("scan", None).unwrap();
        assert!(outer.duration >= inner.duration);
        assert!(outer.duration >= 10.0);
        assert!(monitor.end_operation("scan", None).is_none());
    }

    #[test]
    fn metric_duration_matches_bounds_and_keeps_metadata() {
        let monitor = PerformanceMonitor::new();
        monitor.start_operation("load");
        let mut meta = Metadata::new();
        meta.insert("documents".to_string(), Value::from(3));
        let metric = monitor.end_operation("load", Some(meta)).unwrap();

        assert_eq!(metric.end_time - metric.start_time, metric.duration);
        assert_eq!(metric.metadata.get("documents"), Some(&Value::from(3)));
    }

    #[tokio::test]
    async fn measure_records_async_work() {
        let monitor = PerformanceMonitor::new();
        let (value, metric) = monitor
            .measure("sleepy", async {
                tokio::time::sleep(Duration::from_millis(6)).await;
                42
            })
            .await;
        assert_eq!(value, 42);
        assert_eq!(metric.operation, "sleepy");
        assert!(metric.duration >= 5.0);
        assert_eq!(monitor.metrics().len(), 1);
    }

    #[tokio::test]
    async fn failed_work_is_still_measured() {
        let monitor = PerformanceMonitor::new();
        let (result, metric) = monitor
            .measure_result("boom", async { Err::<(), _>("nope") })
            .await;
        assert_eq!(result, Err("nope"));
        assert_eq!(metric.metadata.get("success"), Some(&Value::Bool(false)));
        assert_eq!(monitor.metrics().len(), 1);
    }

    #[test]
    fn report_aggregates_and_filters_slow() {
        let monitor = PerformanceMonitor::new();
        let _ = monitor.measure_sync("fast", || ());
        let _ = monitor.measure_sync("slow", || std::thread::sleep(Duration::from_millis(25)));

        let report = monitor.generate_report();
        assert_eq!(report.total_operations, 2);
        assert!(report.max_duration >= 20.0);
        assert!(report.min_duration <= report.average_duration);
        assert!((report.total_duration - report.average_duration * 2.0).abs() < 1e-9);

        let slow = monitor.slow_operations(15.0);
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].operation, "slow");

        monitor.clear();
        assert_eq!(monitor.generate_report(), PerformanceReport::default());
    }
}
