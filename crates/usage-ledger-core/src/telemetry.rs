//! In-process metrics: duration histograms and failure counters.
//!
//! Snapshot generation reports through the [`MetricsSink`] trait so callers
//! can forward observations to whatever exporter they run. [`MetricRegistry`]
//! is the built-in sink and keeps everything in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Samples retained per histogram.
pub const DEFAULT_HISTOGRAM_SAMPLES: usize = 1024;

/// Receiver for observability side channels.
pub trait MetricsSink: Send + Sync {
    /// Record one duration observation, in seconds.
    fn observe_duration(&self, name: &str, seconds: f64);

    /// Increment a named counter by one.
    fn increment_counter(&self, name: &str);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_duration(&self, _name: &str, _seconds: f64) {}

    fn increment_counter(&self, _name: &str) {}
}

// =============================================================================
// Histogram
// =============================================================================

/// Fixed-capacity histogram with FIFO eviction.
#[derive(Debug, Clone)]
pub struct Histogram {
    name: String,
    samples: Vec<f64>,
    max_samples: usize,
    total_count: u64,
    total_sum: f64,
    min: f64,
    max: f64,
}

impl Histogram {
    #[must_use]
    pub fn new(name: impl Into<String>, max_samples: usize) -> Self {
        Self {
            name: name.into(),
            samples: Vec::with_capacity(max_samples.min(1024)),
            max_samples: max_samples.max(1),
            total_count: 0,
            total_sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn record(&mut self, value: f64) {
        self.total_count += 1;
        self.total_sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        if self.samples.len() >= self.max_samples {
            self.samples.remove(0);
        }
        self.samples.push(value);
    }

    /// Quantile (0.0–1.0) over the retained samples.
    #[must_use]
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_by(f64::total_cmp);

        let idx = ((sorted.len() as f64 - 1.0) * q.clamp(0.0, 1.0)) as usize;
        Some(sorted[idx.min(sorted.len() - 1)])
    }

    /// Mean of all recorded values, evicted ones included.
    #[must_use]
    pub fn mean(&self) -> Option<f64> {
        if self.total_count == 0 {
            return None;
        }
        Some(self.total_sum / self.total_count as f64)
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.total_count
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn summary(&self) -> HistogramSummary {
        let seen = self.total_count > 0;
        HistogramSummary {
            name: self.name.clone(),
            count: self.total_count,
            retained: self.samples.len() as u64,
            mean: self.mean(),
            min: seen.then_some(self.min),
            max: seen.then_some(self.max),
            p50: self.quantile(0.5),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
        }
    }
}

/// Serializable histogram summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub name: String,
    pub count: u64,
    pub retained: u64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

// =============================================================================
// Metric registry
// =============================================================================

/// Thread-safe registry for named histograms and counters.
///
/// Histograms are created on first observation.
#[derive(Default)]
pub struct MetricRegistry {
    histograms: RwLock<HashMap<String, Histogram>>,
    counters: RwLock<HashMap<String, AtomicU64>>,
}

impl MetricRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_histogram(&self, name: &str, value: f64) {
        let mut map = self.histograms.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| Histogram::new(name, DEFAULT_HISTOGRAM_SAMPLES))
            .record(value);
    }

    pub fn add_counter(&self, name: &str, delta: u64) {
        let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(counter) = map.get(name) {
            counter.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        drop(map);
        let mut map = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    #[must_use]
    pub fn counter_value(&self, name: &str) -> u64 {
        let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn histogram_summary(&self, name: &str) -> Option<HistogramSummary> {
        let map = self.histograms.read().unwrap_or_else(PoisonError::into_inner);
        map.get(name).map(Histogram::summary)
    }

    /// Everything recorded so far, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut histograms: Vec<HistogramSummary> = self
            .histograms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Histogram::summary)
            .collect();
        histograms.sort_by(|a, b| a.name.cmp(&b.name));

        let mut counters: Vec<(String, u64)> = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();
        counters.sort();

        MetricsSnapshot { histograms, counters }
    }
}

impl MetricsSink for MetricRegistry {
    fn observe_duration(&self, name: &str, seconds: f64) {
        self.record_histogram(name, seconds);
    }

    fn increment_counter(&self, name: &str) {
        self.add_counter(name, 1);
    }
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("MetricRegistry")
            .field("histograms", &snapshot.histograms.len())
            .field("counters", &snapshot.counters.len())
            .finish()
    }
}

/// Serializable view of a [`MetricRegistry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub histograms: Vec<HistogramSummary>,
    pub counters: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn histogram_quantiles() {
        let mut h = Histogram::new("gen", 100);
        for v in 1..=100 {
            h.record(f64::from(v));
        }
        assert_eq!(h.quantile(0.0), Some(1.0));
        assert_eq!(h.quantile(1.0), Some(100.0));
        let p50 = h.quantile(0.5).unwrap();
        assert!((50.0..=51.0).contains(&p50));
        assert_eq!(h.mean(), Some(50.5));
    }

    #[test]
    fn histogram_evicts_oldest() {
        let mut h = Histogram::new("gen", 3);
        for v in [100.0, 1.0, 2.0, 3.0] {
            h.record(v);
        }
        let summary = h.summary();
        assert_eq!(summary.count, 4);
        assert_eq!(summary.retained, 3);
        assert_eq!(summary.max, Some(100.0));
        assert_eq!(h.quantile(1.0), Some(3.0));
    }

    #[test]
    fn empty_histogram_summary() {
        let summary = Histogram::new("empty", 10).summary();
        assert_eq!(summary.count, 0);
        assert!(summary.mean.is_none());
        assert!(summary.min.is_none());
        assert!(summary.p99.is_none());
    }

    #[test]
    fn registry_counts_and_observes() {
        let registry = MetricRegistry::new();
        registry.increment_counter("failures_total");
        registry.increment_counter("failures_total");
        registry.observe_duration("duration_seconds", 0.25);

        assert_eq!(registry.counter_value("failures_total"), 2);
        assert_eq!(registry.counter_value("unknown"), 0);
        let summary = registry.histogram_summary("duration_seconds").unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.p50, Some(0.25));
    }

    #[test]
    fn registry_is_shareable_across_threads() {
        let registry = Arc::new(MetricRegistry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        r.increment_counter("hits");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.counter_value("hits"), 1000);
    }

    #[test]
    fn snapshot_is_sorted_and_serializable() {
        let registry = MetricRegistry::new();
        registry.increment_counter("b");
        registry.increment_counter("a");
        registry.observe_duration("z", 1.0);
        registry.observe_duration("y", 1.0);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.counters[0].0, "a");
        assert_eq!(snapshot.histograms[0].name, "y");
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"counters\""));
    }

    #[test]
    fn noop_sink_accepts_everything() {
        let sink: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);
        sink.observe_duration("x", 1.0);
        sink.increment_counter("y");
    }
}
