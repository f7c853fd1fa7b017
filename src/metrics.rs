use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

const MAX_PROCESSING_TIME_HISTORY: usize = 100;

#[derive(Debug, Default)]
struct MetricsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    retry_count: u64,
    event_backlog: u64,
    last_processing_time_ms: u64,
    processing_times_ms: VecDeque<u64>,
}

/// Counters and a bounded latency window for the webhook ingress.
///
/// Latencies measure the synchronous handoff (signature check, schema
/// check, spawn), not eventual processing.
#[derive(Debug, Default)]
pub struct WebhookMetrics {
    inner: Mutex<MetricsInner>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_processing_time: f64,
    pub last_processing_time: u64,
    pub retry_count: u64,
    pub event_backlog: u64,
    pub success_rate: f64,
    pub p99_processing_time: u64,
    pub performance_acceptable: bool,
}

impl WebhookMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, processing_time_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        inner.successful_requests += 1;
        record_time(&mut inner, processing_time_ms);
    }

    pub fn record_failure(&self, processing_time_ms: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_requests += 1;
        inner.failed_requests += 1;
        record_time(&mut inner, processing_time_ms);
        tracing::warn!(processing_time_ms, "webhook failure recorded");
    }

    pub fn record_retry(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.retry_count += 1;
    }

    pub fn set_event_backlog(&self, count: u64) {
        self.inner.lock().unwrap().event_backlog = count;
    }

    pub fn success_rate(&self) -> f64 {
        success_rate(&self.inner.lock().unwrap())
    }

    pub fn p99_processing_time(&self) -> u64 {
        p99(&self.inner.lock().unwrap())
    }

    /// Acceptance criteria: p99 under 500ms and success rate above 95%.
    pub fn is_performance_acceptable(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        p99(&inner) < 500 && success_rate(&inner) > 95.0
    }

    pub fn snapshot(&self) -> WebhookMetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let average = if inner.processing_times_ms.is_empty() {
            0.0
        } else {
            inner.processing_times_ms.iter().sum::<u64>() as f64
                / inner.processing_times_ms.len() as f64
        };
        WebhookMetricsSnapshot {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            average_processing_time: average,
            last_processing_time: inner.last_processing_time_ms,
            retry_count: inner.retry_count,
            event_backlog: inner.event_backlog,
            success_rate: success_rate(&inner),
            p99_processing_time: p99(&inner),
            performance_acceptable: p99(&inner) < 500 && success_rate(&inner) > 95.0,
        }
    }
}

fn record_time(inner: &mut MetricsInner, processing_time_ms: u64) {
    inner.last_processing_time_ms = processing_time_ms;
    inner.processing_times_ms.push_back(processing_time_ms);
    if inner.processing_times_ms.len() > MAX_PROCESSING_TIME_HISTORY {
        inner.processing_times_ms.pop_front();
    }
}

fn success_rate(inner: &MetricsInner) -> f64 {
    if inner.total_requests == 0 {
        return 100.0;
    }
    inner.successful_requests as f64 / inner.total_requests as f64 * 100.0
}

fn p99(inner: &MetricsInner) -> u64 {
    if inner.processing_times_ms.is_empty() {
        return 0;
    }
    let mut sorted: Vec<u64> = inner.processing_times_ms.iter().copied().collect();
    sorted.sort_unstable();
    let index = ((sorted.len() as f64 * 0.99).ceil() as usize).saturating_sub(1);
    sorted[index.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_metrics_are_healthy() {
        let metrics = WebhookMetrics::new();
        assert_eq!(metrics.success_rate(), 100.0);
        assert_eq!(metrics.p99_processing_time(), 0);
        assert!(metrics.is_performance_acceptable());
    }

    #[test]
    fn success_rate_tracks_failures() {
        let metrics = WebhookMetrics::new();
        for _ in 0..9 {
            metrics.record_success(10);
        }
        metrics.record_failure(10);
        assert_eq!(metrics.success_rate(), 90.0);
        assert!(!metrics.is_performance_acceptable());
    }

    #[test]
    fn p99_reflects_slow_tail() {
        let metrics = WebhookMetrics::new();
        for _ in 0..90 {
            metrics.record_success(10);
        }
        for _ in 0..10 {
            metrics.record_success(900);
        }
        assert_eq!(metrics.p99_processing_time(), 900);
        assert!(!metrics.is_performance_acceptable());
    }

    #[test]
    fn latency_window_is_bounded() {
        let metrics = WebhookMetrics::new();
        for _ in 0..50 {
            metrics.record_success(1000);
        }
        // The slow samples age out of the 100-entry window.
        for _ in 0..100 {
            metrics.record_success(5);
        }
        assert_eq!(metrics.p99_processing_time(), 5);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 150);
        assert_eq!(snapshot.average_processing_time, 5.0);
    }

    #[test]
    fn retry_and_backlog_counters() {
        let metrics = WebhookMetrics::new();
        metrics.record_retry();
        metrics.record_retry();
        metrics.set_event_backlog(7);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.retry_count, 2);
        assert_eq!(snapshot.event_backlog, 7);
    }
}
