//! Metrics collection for the messaging runtime.
//!
//! Two surfaces: an in-memory per-operation timer registry that callers
//! can query programmatically, and Prometheus counters/gauges exposed for
//! scraping via [`gather_metrics`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::time::Instant;

/// Global Prometheus registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Pub/sub wire metrics
pub mod pubsub {
    use super::REGISTRY;
    use prometheus::{
        register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
        register_int_gauge_with_registry, HistogramVec, IntCounterVec, IntGauge, Opts,
    };

    /// Messages published, labeled by channel kind.
    pub static MESSAGES_PUBLISHED: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new("redbus_messages_published_total", "Total messages published"),
                &["channel_kind"],
                REGISTRY.clone()
            )
            .expect("Failed to register MESSAGES_PUBLISHED")
        });

    /// Messages received by subscribers, labeled by channel kind.
    pub static MESSAGES_RECEIVED: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new("redbus_messages_received_total", "Total messages received"),
                &["channel_kind"],
                REGISTRY.clone()
            )
            .expect("Failed to register MESSAGES_RECEIVED")
        });

    /// Payloads forwarded to a dead-letter channel.
    pub static DEAD_LETTERS_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new("redbus_dead_letters_total", "Total payloads dead-lettered"),
                &["reason"],
                REGISTRY.clone()
            )
            .expect("Failed to register DEAD_LETTERS_TOTAL")
        });

    /// Handler invocations that returned an error.
    pub static HANDLER_ERRORS_TOTAL: std::sync::LazyLock<IntCounterVec> =
        std::sync::LazyLock::new(|| {
            register_int_counter_vec_with_registry!(
                Opts::new("redbus_handler_errors_total", "Total handler errors"),
                &["channel_kind"],
                REGISTRY.clone()
            )
            .expect("Failed to register HANDLER_ERRORS_TOTAL")
        });

    /// Currently active subscriptions.
    pub static SUBSCRIPTIONS_ACTIVE: std::sync::LazyLock<IntGauge> =
        std::sync::LazyLock::new(|| {
            register_int_gauge_with_registry!(
                "redbus_subscriptions_active",
                "Number of active subscriptions",
                REGISTRY.clone()
            )
            .expect("Failed to register SUBSCRIPTIONS_ACTIVE")
        });

    /// Connections currently leased from the pool.
    pub static POOL_CONNECTIONS_ACTIVE: std::sync::LazyLock<IntGauge> =
        std::sync::LazyLock::new(|| {
            register_int_gauge_with_registry!(
                "redbus_pool_connections_active",
                "Number of leased pool connections",
                REGISTRY.clone()
            )
            .expect("Failed to register POOL_CONNECTIONS_ACTIVE")
        });

    /// Publish round-trip duration in seconds.
    pub static PUBLISH_DURATION_SECONDS: std::sync::LazyLock<HistogramVec> =
        std::sync::LazyLock::new(|| {
            register_histogram_vec_with_registry!(
                "redbus_publish_duration_seconds",
                "Publish round-trip duration in seconds",
                &["channel_kind"],
                REGISTRY.clone()
            )
            .expect("Failed to register PUBLISH_DURATION_SECONDS")
        });
}

/// One completed operation sample.
#[derive(Debug, Clone)]
pub struct OperationSample {
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Aggregate view over an operation's recorded samples.
#[derive(Debug, Clone)]
pub struct OperationStats {
    pub name: String,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub min_duration: Duration,
    pub avg_duration: Duration,
    pub max_duration: Duration,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// In-flight timer handle returned by [`OperationMetrics::start_operation`].
#[derive(Debug)]
pub struct OperationTimer {
    name: String,
    started: Instant,
    metrics: OperationMetrics,
}

impl OperationTimer {
    /// Record the sample for this operation.
    pub fn finish(self, success: bool, error: Option<&str>) {
        self.metrics
            .record(&self.name, self.started.elapsed(), success, error);
    }
}

/// Concurrency-safe registry of operation timings with bounded history.
#[derive(Debug, Clone)]
pub struct OperationMetrics {
    histories: Arc<DashMap<String, Mutex<VecDeque<OperationSample>>>>,
    history_size: usize,
    enabled: bool,
}

impl OperationMetrics {
    #[must_use]
    pub fn new(history_size: usize) -> Self {
        Self {
            histories: Arc::new(DashMap::new()),
            history_size: history_size.max(1),
            enabled: true,
        }
    }

    /// A disabled registry records nothing and reports no stats.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            histories: Arc::new(DashMap::new()),
            history_size: 1,
            enabled: false,
        }
    }

    /// Begin timing `name`. Finish the returned timer to record the sample.
    #[must_use]
    pub fn start_operation(&self, name: &str) -> OperationTimer {
        OperationTimer {
            name: name.to_string(),
            started: Instant::now(),
            metrics: self.clone(),
        }
    }

    /// Record a completed sample directly.
    pub fn record(&self, name: &str, duration: Duration, success: bool, error: Option<&str>) {
        if !self.enabled {
            return;
        }
        let entry = self
            .histories
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut history = entry.lock();
        if history.len() == self.history_size {
            history.pop_front();
        }
        history.push_back(OperationSample {
            duration,
            success,
            error: error.map(str::to_string),
            at: Utc::now(),
        });
    }

    /// Aggregates for one operation name, or `None` if never recorded.
    #[must_use]
    pub fn stats(&self, name: &str) -> Option<OperationStats> {
        let entry = self.histories.get(name)?;
        let history = entry.lock();
        if history.is_empty() {
            return None;
        }

        let total = history.len() as u64;
        let succeeded = history.iter().filter(|s| s.success).count() as u64;
        let mut min = Duration::MAX;
        let mut max = Duration::ZERO;
        let mut sum = Duration::ZERO;
        let mut last_error = None;
        let mut last_error_at = None;

        for sample in history.iter() {
            min = min.min(sample.duration);
            max = max.max(sample.duration);
            sum += sample.duration;
            if let Some(err) = &sample.error {
                last_error = Some(err.clone());
                last_error_at = Some(sample.at);
            }
        }

        Some(OperationStats {
            name: name.to_string(),
            total,
            succeeded,
            failed: total - succeeded,
            success_rate: succeeded as f64 / total as f64,
            min_duration: min,
            avg_duration: sum / total as u32,
            max_duration: max,
            last_error,
            last_error_at,
        })
    }

    /// Aggregates for every recorded operation.
    #[must_use]
    pub fn all_stats(&self) -> Vec<OperationStats> {
        self.histories
            .iter()
            .filter_map(|entry| self.stats(entry.key()))
            .collect()
    }

    /// Drop all recorded history.
    pub fn reset(&self) {
        self.histories.clear();
    }
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self::new(1_000)
    }
}

/// Process-wide operation metrics shared by services that are not wired
/// to an explicit registry.
pub fn global() -> &'static OperationMetrics {
    static GLOBAL: std::sync::LazyLock<OperationMetrics> =
        std::sync::LazyLock::new(OperationMetrics::default);
    &GLOBAL
}

/// Time an async operation as `name`, recording success or failure.
///
/// Call sites stay explicit: `timed(metrics, "publisher.publish", fut)`.
pub async fn timed<T, E, Fut>(
    metrics: &OperationMetrics,
    name: &str,
    fut: Fut,
) -> std::result::Result<T, E>
where
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let timer = metrics.start_operation(name);
    let result = fut.await;
    match &result {
        Ok(_) => timer.finish(true, None),
        Err(e) => timer.finish(false, Some(&e.to_string())),
    }
    result
}

/// Expose all registered metrics in Prometheus text format.
#[must_use]
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Failed to encode metrics\n");
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Metrics buffer contains invalid UTF-8: {}", e);
        String::from("# Invalid UTF-8 in metrics\n")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_aggregate() {
        let metrics = OperationMetrics::new(100);
        metrics.record("publish", Duration::from_millis(10), true, None);
        metrics.record("publish", Duration::from_millis(30), true, None);
        metrics.record("publish", Duration::from_millis(20), false, Some("boom"));

        let stats = metrics.stats("publish").unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < f64::EPSILON);
        assert_eq!(stats.min_duration, Duration::from_millis(10));
        assert_eq!(stats.max_duration, Duration::from_millis(30));
        assert_eq!(stats.avg_duration, Duration::from_millis(20));
        assert_eq!(stats.last_error.as_deref(), Some("boom"));
        assert!(stats.last_error_at.is_some());
    }

    #[test]
    fn test_history_is_bounded() {
        let metrics = OperationMetrics::new(5);
        for _ in 0..20 {
            metrics.record("op", Duration::from_millis(1), true, None);
        }
        assert_eq!(metrics.stats("op").unwrap().total, 5);
    }

    #[test]
    fn test_unknown_operation_has_no_stats() {
        let metrics = OperationMetrics::new(10);
        assert!(metrics.stats("nope").is_none());
    }

    #[test]
    fn test_disabled_registry_records_nothing() {
        let metrics = OperationMetrics::disabled();
        metrics.record("op", Duration::from_millis(1), true, None);
        assert!(metrics.stats("op").is_none());
    }

    #[tokio::test]
    async fn test_timed_wrapper_records_outcomes() {
        let metrics = OperationMetrics::new(10);

        let ok: Result<u32, String> = timed(&metrics, "svc.call", async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let err: Result<u32, String> =
            timed(&metrics, "svc.call", async { Err("down".to_string()) }).await;
        assert!(err.is_err());

        let stats = metrics.stats("svc.call").unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.last_error.as_deref(), Some("down"));
    }

    #[test]
    fn test_gather_metrics_encodes() {
        pubsub::MESSAGES_PUBLISHED.with_label_values(&["chat"]).inc();
        let output = gather_metrics();
        assert!(output.contains("redbus_messages_published_total"));
    }
}
