use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const TASK_TRANSITIONS: &str = "task_transitions_total";
pub const JOB_TRANSITIONS: &str = "job_transitions_total";
pub const TASK_ERRORS: &str = "task_errors_total";
pub const STORE_ERRORS: &str = "store_errors_total";
pub const TASKS_IN_FLIGHT: &str = "tasks_in_flight";
pub const DISPATCH_LATENCY: &str = "task_dispatch_latency_seconds";
pub const TASK_DURATION: &str = "task_duration_seconds";

// Seconds: 10ms .. 5min
const DEFAULT_BUCKETS: [f64; 10] = [0.01, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

type Labels = BTreeMap<String, String>;

/// Counters, gauges and histograms describing engine activity.
///
/// Shared by every job controller; each update takes one short lock.
#[derive(Default)]
pub struct MetricsCollector {
    counters: Mutex<HashMap<String, Counter>>,
    gauges: Mutex<HashMap<String, Gauge>>,
    histograms: Mutex<HashMap<String, Histogram>>,
}

/// Counter - monotonically increasing value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Counter {
    pub name: String,
    pub value: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Gauge - value that can go up or down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gauge {
    pub name: String,
    pub value: f64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Histogram - tracks distribution of values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
    pub labels: Labels,
    pub last_updated: DateTime<Utc>,
}

/// Point-in-time copy of every metric, for export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: Vec<Counter>,
    pub gauges: Vec<Gauge>,
    pub histograms: Vec<Histogram>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A task moved from one state to another
    pub fn task_transition(&self, from: &str, to: &str) {
        self.increment_counter(TASK_TRANSITIONS, &[("from", from), ("to", to)]);
    }

    pub fn job_transition(&self, from: &str, to: &str) {
        self.increment_counter(JOB_TRANSITIONS, &[("from", from), ("to", to)]);
    }

    /// A task attempt ended with an error of the given kind
    pub fn task_error(&self, kind: &str) {
        self.increment_counter(TASK_ERRORS, &[("kind", kind)]);
    }

    pub fn store_error(&self, operation: &str) {
        self.increment_counter(STORE_ERRORS, &[("operation", operation)]);
    }

    /// Time between a task becoming eligible and its attempt starting
    pub fn dispatch_latency(&self, latency: Duration) {
        self.observe_histogram(DISPATCH_LATENCY, latency.as_secs_f64(), &[]);
    }

    pub fn task_duration(&self, outcome: &str, duration: Duration) {
        self.observe_histogram(TASK_DURATION, duration.as_secs_f64(), &[("outcome", outcome)]);
    }

    pub fn tasks_in_flight(&self, delta: f64) {
        self.add_gauge(TASKS_IN_FLIGHT, delta, &[]);
    }

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        let labels = to_labels(labels);
        let key = metric_key(name, &labels);

        lock(&self.counters)
            .entry(key)
            .and_modify(|c| {
                c.value += 1;
                c.last_updated = Utc::now();
            })
            .or_insert_with(|| Counter {
                name: name.to_string(),
                value: 1,
                labels,
                last_updated: Utc::now(),
            });
    }

    pub fn add_gauge(&self, name: &str, delta: f64, labels: &[(&str, &str)]) {
        let labels = to_labels(labels);
        let key = metric_key(name, &labels);

        lock(&self.gauges)
            .entry(key)
            .and_modify(|g| {
                g.value += delta;
                g.last_updated = Utc::now();
            })
            .or_insert_with(|| Gauge {
                name: name.to_string(),
                value: delta,
                labels,
                last_updated: Utc::now(),
            });
    }

    pub fn observe_histogram(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        let labels = to_labels(labels);
        let key = metric_key(name, &labels);

        lock(&self.histograms)
            .entry(key)
            .or_insert_with(|| Histogram {
                name: name.to_string(),
                buckets: DEFAULT_BUCKETS.to_vec(),
                counts: vec![0; DEFAULT_BUCKETS.len()],
                sum: 0.0,
                count: 0,
                labels,
                last_updated: Utc::now(),
            })
            .observe(value);
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = metric_key(name, &to_labels(labels));
        lock(&self.counters).get(&key).map_or(0, |c| c.value)
    }

    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        let key = metric_key(name, &to_labels(labels));
        lock(&self.gauges).get(&key).map_or(0.0, |g| g.value)
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Option<Histogram> {
        let key = metric_key(name, &to_labels(labels));
        lock(&self.histograms).get(&key).cloned()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            counters: lock(&self.counters).values().cloned().collect(),
            gauges: lock(&self.gauges).values().cloned().collect(),
            histograms: lock(&self.histograms).values().cloned().collect(),
        };
        snapshot.counters.sort_by(|a, b| a.name.cmp(&b.name).then(a.labels.cmp(&b.labels)));
        snapshot.gauges.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.histograms.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}

fn to_labels(labels: &[(&str, &str)]) -> Labels {
    labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Unique key for a metric with labels; labels are already sorted.
fn metric_key(name: &str, labels: &Labels) -> String {
    if labels.is_empty() {
        return name.to_string();
    }

    let label_str = labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    format!("{}:{}", name, label_str)
}

impl Histogram {
    fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bucket, count) in self.buckets.iter().zip(self.counts.iter_mut()) {
            if value <= *bucket {
                *count += 1;
            }
        }
        self.last_updated = Utc::now();
    }

    /// Upper bound of the bucket holding the p-th percentile
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=100.0).contains(&p) {
            return None;
        }

        let target_count = ((self.count as f64) * (p / 100.0)).ceil() as u64;

        self.counts
            .iter()
            .position(|count| *count >= target_count)
            .map(|i| self.buckets[i])
    }

    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counts_by_kind() {
        let metrics = MetricsCollector::new();

        metrics.task_error("timeout");
        metrics.task_error("timeout");
        metrics.task_error("execution_failure");

        assert_eq!(metrics.counter(TASK_ERRORS, &[("kind", "timeout")]), 2);
        assert_eq!(metrics.counter(TASK_ERRORS, &[("kind", "execution_failure")]), 1);
        assert_eq!(metrics.counter(TASK_ERRORS, &[("kind", "cancelled")]), 0);
    }

    #[test]
    fn test_label_order_does_not_matter() {
        let metrics = MetricsCollector::new();

        metrics.increment_counter("x", &[("a", "1"), ("b", "2")]);
        metrics.increment_counter("x", &[("b", "2"), ("a", "1")]);

        assert_eq!(metrics.counter("x", &[("a", "1"), ("b", "2")]), 2);
    }

    #[test]
    fn test_in_flight_gauge() {
        let metrics = MetricsCollector::new();

        metrics.tasks_in_flight(1.0);
        metrics.tasks_in_flight(1.0);
        metrics.tasks_in_flight(-1.0);

        assert_eq!(metrics.gauge(TASKS_IN_FLIGHT, &[]), 1.0);
    }

    #[test]
    fn test_histogram_average_and_percentile() {
        let metrics = MetricsCollector::new();

        for millis in [100, 200, 300, 2_000] {
            metrics.task_duration("succeeded", Duration::from_millis(millis));
        }

        let histogram = metrics
            .histogram(TASK_DURATION, &[("outcome", "succeeded")])
            .unwrap();
        assert_eq!(histogram.count, 4);
        assert!((histogram.average().unwrap() - 0.65).abs() < 1e-9);
        assert_eq!(histogram.percentile(50.0), Some(0.5));
        assert_eq!(histogram.percentile(100.0), Some(5.0));
        assert_eq!(histogram.percentile(101.0), None);
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let metrics = MetricsCollector::new();

        metrics.job_transition("running", "succeeded");
        metrics.job_transition("created", "running");
        metrics.dispatch_latency(Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.counters.len(), 2);
        assert_eq!(snapshot.counters[0].labels["from"], "created");
        assert_eq!(snapshot.histograms.len(), 1);
    }
}
