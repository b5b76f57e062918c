//! Process-wide statement counters, latency rings and slow statement history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::warn;

const DEFAULT_HISTORY_SIZE: usize = 200;
const DEFAULT_SLOW_THRESHOLD_MS: u64 = 1_000;
const MAX_TEXT_LEN: usize = 1024;

/// Category of work a metric sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Query,
    Update,
    Storage,
}

impl OperationKind {
    fn slot(self) -> usize {
        match self {
            OperationKind::Query => 0,
            OperationKind::Update => 1,
            OperationKind::Storage => 2,
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    started_at: Instant,
    started_at_ms: u64,
    slow_threshold: Duration,
    history_size: usize,
    totals: [AtomicU64; 3],
    in_flight: [AtomicU64; 3],
    errors: AtomicU64,
    slow: AtomicU64,
    latencies: [RwLock<VecDeque<u64>>; 3],
    slow_statements: RwLock<VecDeque<SlowStatement>>,
    recent_errors: RwLock<VecDeque<ErrorEvent>>,
}

#[derive(Clone, Serialize)]
pub struct SlowStatement {
    pub timestamp_ms: u64,
    pub duration_ms: u64,
    pub kind: OperationKind,
    pub text: String,
    pub rows: Option<u64>,
}

#[derive(Clone, Serialize)]
pub struct ErrorEvent {
    pub timestamp_ms: u64,
    pub kind: OperationKind,
    pub text: String,
    pub message: String,
}

#[derive(Clone, Serialize)]
pub struct MetricsSnapshot {
    pub started_at_ms: u64,
    pub uptime_ms: u64,
    pub slow_threshold_ms: u64,
    pub history_size: usize,
    pub totals: CountsSnapshot,
    pub in_flight: CountsSnapshot,
    pub errors: u64,
    pub slow_statements_total: u64,
    pub latency: LatencySnapshot,
    pub slow_statements: Vec<SlowStatement>,
    pub recent_errors: Vec<ErrorEvent>,
}

#[derive(Clone, Serialize)]
pub struct CountsSnapshot {
    pub queries: u64,
    pub updates: u64,
    pub storage: u64,
}

#[derive(Clone, Serialize)]
pub struct LatencySnapshot {
    pub queries: LatencySummary,
    pub updates: LatencySummary,
    pub storage: LatencySummary,
}

#[derive(Clone, Serialize, Default)]
pub struct LatencySummary {
    pub count: usize,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub max_ms: u64,
}

/// Decrements the in-flight gauge for its kind when dropped.
pub struct InFlightGuard {
    inner: Arc<MetricsInner>,
    kind: OperationKind,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight[self.kind.slot()].fetch_sub(1, Ordering::Relaxed);
    }
}

impl Metrics {
    pub fn new(slow_threshold_ms: u64, history_size: usize) -> Self {
        let history_size = if history_size == 0 {
            DEFAULT_HISTORY_SIZE
        } else {
            history_size
        };
        let slow_threshold_ms = if slow_threshold_ms == 0 {
            DEFAULT_SLOW_THRESHOLD_MS
        } else {
            slow_threshold_ms
        };
        let ring = || RwLock::new(VecDeque::with_capacity(history_size));
        Self {
            inner: Arc::new(MetricsInner {
                started_at: Instant::now(),
                started_at_ms: now_millis(),
                slow_threshold: Duration::from_millis(slow_threshold_ms),
                history_size,
                totals: Default::default(),
                in_flight: Default::default(),
                errors: AtomicU64::new(0),
                slow: AtomicU64::new(0),
                latencies: [ring(), ring(), ring()],
                slow_statements: RwLock::new(VecDeque::with_capacity(history_size)),
                recent_errors: RwLock::new(VecDeque::with_capacity(history_size)),
            }),
        }
    }

    pub fn start(&self, kind: OperationKind) -> InFlightGuard {
        self.inner.in_flight[kind.slot()].fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            inner: self.inner.clone(),
            kind,
        }
    }

    pub fn record_success(
        &self,
        kind: OperationKind,
        text: &str,
        duration: Duration,
        rows: Option<u64>,
    ) {
        self.record(kind, text, duration, rows);
    }

    pub fn record_error(&self, kind: OperationKind, text: &str, duration: Duration, message: String) {
        self.record(kind, text, duration, None);
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
        let event = ErrorEvent {
            timestamp_ms: now_millis(),
            kind,
            text: compact_text(text),
            message,
        };
        let mut errors = self
            .inner
            .recent_errors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        push_ring(&mut errors, event, self.inner.history_size);
    }

    fn record(&self, kind: OperationKind, text: &str, duration: Duration, rows: Option<u64>) {
        self.inner.totals[kind.slot()].fetch_add(1, Ordering::Relaxed);
        let duration_ms = duration.as_millis() as u64;
        {
            let mut ring = self.inner.latencies[kind.slot()]
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            push_ring(&mut ring, duration_ms, self.inner.history_size);
        }

        if duration < self.inner.slow_threshold {
            return;
        }
        self.inner.slow.fetch_add(1, Ordering::Relaxed);
        let text = compact_text(text);
        warn!(
            duration_ms,
            threshold_ms = self.inner.slow_threshold.as_millis() as u64,
            kind = ?kind,
            rows = ?rows,
            text = %text,
            "slow statement recorded"
        );
        let entry = SlowStatement {
            timestamp_ms: now_millis(),
            duration_ms,
            kind,
            text,
            rows,
        };
        let mut slow = self
            .inner
            .slow_statements
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        push_ring(&mut slow, entry, self.inner.history_size);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        let counts = |gauges: &[AtomicU64; 3]| CountsSnapshot {
            queries: gauges[0].load(Ordering::Relaxed),
            updates: gauges[1].load(Ordering::Relaxed),
            storage: gauges[2].load(Ordering::Relaxed),
        };
        let latency = |slot: usize| {
            let values = inner.latencies[slot]
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .iter()
                .copied()
                .collect::<Vec<_>>();
            summarize_latencies(values)
        };
        let slow_statements = inner
            .slow_statements
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect();
        let recent_errors = inner
            .recent_errors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .rev()
            .cloned()
            .collect();

        MetricsSnapshot {
            started_at_ms: inner.started_at_ms,
            uptime_ms: inner.started_at.elapsed().as_millis() as u64,
            slow_threshold_ms: inner.slow_threshold.as_millis() as u64,
            history_size: inner.history_size,
            totals: counts(&inner.totals),
            in_flight: counts(&inner.in_flight),
            errors: inner.errors.load(Ordering::Relaxed),
            slow_statements_total: inner.slow.load(Ordering::Relaxed),
            latency: LatencySnapshot {
                queries: latency(0),
                updates: latency(1),
                storage: latency(2),
            },
            slow_statements,
            recent_errors,
        }
    }
}

fn push_ring<T>(target: &mut VecDeque<T>, value: T, max: usize) {
    if target.len() >= max {
        target.pop_front();
    }
    target.push_back(value);
}

fn summarize_latencies(mut values: Vec<u64>) -> LatencySummary {
    if values.is_empty() {
        return LatencySummary::default();
    }
    values.sort_unstable();
    let count = values.len();
    let sum: u64 = values.iter().sum();
    LatencySummary {
        count,
        avg_ms: sum / count as u64,
        p50_ms: percentile(&values, 0.50),
        p95_ms: percentile(&values, 0.95),
        p99_ms: percentile(&values, 0.99),
        max_ms: values[count - 1],
    }
}

fn percentile(sorted: &[u64], quantile: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (quantile * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

fn compact_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX_TEXT_LEN {
        return collapsed;
    }
    let mut out: String = collapsed.chars().take(MAX_TEXT_LEN).collect();
    out.push_str("...");
    out
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_arguments_fall_back_to_defaults() {
        let snapshot = Metrics::new(0, 0).snapshot();
        assert_eq!(snapshot.slow_threshold_ms, DEFAULT_SLOW_THRESHOLD_MS);
        assert_eq!(snapshot.history_size, DEFAULT_HISTORY_SIZE);
    }

    #[test]
    fn in_flight_guard_tracks_each_kind() {
        let metrics = Metrics::new(100, 8);
        {
            let _q = metrics.start(OperationKind::Query);
            let _s = metrics.start(OperationKind::Storage);
            let snapshot = metrics.snapshot();
            assert_eq!(snapshot.in_flight.queries, 1);
            assert_eq!(snapshot.in_flight.updates, 0);
            assert_eq!(snapshot.in_flight.storage, 1);
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.in_flight.queries, 0);
        assert_eq!(snapshot.in_flight.storage, 0);
    }

    #[test]
    fn rings_are_capped_and_slow_statements_recorded() {
        let metrics = Metrics::new(10, 2);
        metrics.record_success(OperationKind::Query, "SELECT 1", Duration::from_millis(1), Some(1));
        metrics.record_success(OperationKind::Query, "SELECT 2", Duration::from_millis(20), Some(1));
        metrics.record_success(OperationKind::Query, "SELECT 3", Duration::from_millis(30), Some(1));
        metrics.record_error(
            OperationKind::Update,
            "INSERT INTO t VALUES (1)",
            Duration::from_millis(2),
            "constraint".to_string(),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.totals.queries, 3);
        assert_eq!(snapshot.totals.updates, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.slow_statements_total, 2);
        assert_eq!(snapshot.latency.queries.count, 2);
        assert_eq!(snapshot.slow_statements.len(), 2);
        assert_eq!(snapshot.slow_statements[0].text, "SELECT 3");
        assert_eq!(snapshot.recent_errors[0].message, "constraint");
    }

    #[test]
    fn storage_latencies_summarize_with_duplicates() {
        let summary = summarize_latencies(vec![5, 50, 15, 25, 5]);
        assert_eq!(
            (summary.count, summary.avg_ms, summary.p50_ms),
            (5, 20, 15)
        );
        assert_eq!(summary.p95_ms, 50);
        assert_eq!(summary.max_ms, 50);

        let empty = summarize_latencies(Vec::new());
        assert_eq!((empty.count, empty.max_ms), (0, 0));
    }

    #[test]
    fn long_text_is_truncated() {
        let text = format!("SELECT   {}", "x".repeat(MAX_TEXT_LEN * 2));
        let compacted = compact_text(&text);
        assert!(compacted.ends_with("..."));
        assert_eq!(compact_text("a \n\t b"), "a b");
    }
}
