//! Prometheus-backed metrics registry and snapshot helpers.
//!
//! # Design
//! - Collector registration is private; callers only see typed recorders.
//! - Gauges reflect the latest value pushed by the owning service.

use std::sync::Arc;

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
    core::Collector,
};
use serde::Serialize;

use crate::error::{MetricStage, TelemetryError, TelemetryResult};

/// Prometheus-backed metrics registry shared across services.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    queue_depth: IntGauge,
    operations_running: IntGauge,
    operations_total: IntCounterVec,
    bytes_processed_total: IntCounter,
    cache_used_bytes: IntGaugeVec,
    cache_evictions_total: IntCounterVec,
    staging_requests_total: IntCounterVec,
}

/// Snapshot of selected gauges and counters for health reporting.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Operations waiting for dispatch.
    pub queue_depth: i64,
    /// Occupied worker slots.
    pub operations_running: i64,
    /// Bytes reported by finished operations.
    pub bytes_processed_total: u64,
    /// Operations that completed successfully.
    pub operations_completed_total: u64,
    /// Operations that failed.
    pub operations_failed_total: u64,
}

impl Metrics {
    /// Construct a new metrics registry with the standard collectors registered.
    ///
    /// # Errors
    ///
    /// Returns an error if any collector cannot be built or registered.
    pub fn new() -> TelemetryResult<Self> {
        let registry = Registry::new();

        let queue_depth = collector(
            "stratum_queue_depth",
            IntGauge::with_opts(Opts::new(
                "stratum_queue_depth",
                "Operations waiting for dispatch",
            )),
        )?;
        let operations_running = collector(
            "stratum_operations_running",
            IntGauge::with_opts(Opts::new(
                "stratum_operations_running",
                "Worker slots currently occupied",
            )),
        )?;
        let operations_total = collector(
            "stratum_operations_total",
            IntCounterVec::new(
                Opts::new(
                    "stratum_operations_total",
                    "Operations reaching a terminal state",
                ),
                &["status"],
            ),
        )?;
        let bytes_processed_total = collector(
            "stratum_bytes_processed_total",
            IntCounter::with_opts(Opts::new(
                "stratum_bytes_processed_total",
                "Bytes reported by operation handlers",
            )),
        )?;
        let cache_used_bytes = collector(
            "stratum_cache_used_bytes",
            IntGaugeVec::new(
                Opts::new("stratum_cache_used_bytes", "Bytes held per cache pool"),
                &["pool"],
            ),
        )?;
        let cache_evictions_total = collector(
            "stratum_cache_evictions_total",
            IntCounterVec::new(
                Opts::new(
                    "stratum_cache_evictions_total",
                    "Cache entries evicted by policy",
                ),
                &["policy"],
            ),
        )?;
        let staging_requests_total = collector(
            "stratum_staging_requests_total",
            IntCounterVec::new(
                Opts::new(
                    "stratum_staging_requests_total",
                    "HSM staging waits by outcome",
                ),
                &["outcome"],
            ),
        )?;

        register(&registry, "stratum_queue_depth", &queue_depth)?;
        register(&registry, "stratum_operations_running", &operations_running)?;
        register(&registry, "stratum_operations_total", &operations_total)?;
        register(
            &registry,
            "stratum_bytes_processed_total",
            &bytes_processed_total,
        )?;
        register(&registry, "stratum_cache_used_bytes", &cache_used_bytes)?;
        register(
            &registry,
            "stratum_cache_evictions_total",
            &cache_evictions_total,
        )?;
        register(
            &registry,
            "stratum_staging_requests_total",
            &staging_requests_total,
        )?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                queue_depth,
                operations_running,
                operations_total,
                bytes_processed_total,
                cache_used_bytes,
                cache_evictions_total,
                staging_requests_total,
            }),
        })
    }

    /// Set the queue depth gauge.
    pub fn set_queue_depth(&self, depth: usize) {
        self.inner.queue_depth.set(saturating_i64(depth as u64));
    }

    /// Set the running operations gauge.
    pub fn set_operations_running(&self, running: usize) {
        self.inner
            .operations_running
            .set(saturating_i64(running as u64));
    }

    /// Count an operation reaching `status`.
    pub fn inc_operation(&self, status: &str) {
        self.inner
            .operations_total
            .with_label_values(&[status])
            .inc();
    }

    /// Add processed bytes.
    pub fn add_bytes_processed(&self, bytes: u64) {
        self.inner.bytes_processed_total.inc_by(bytes);
    }

    /// Set the used-bytes gauge for a cache pool.
    pub fn set_cache_used_bytes(&self, pool: &str, bytes: u64) {
        self.inner
            .cache_used_bytes
            .with_label_values(&[pool])
            .set(saturating_i64(bytes));
    }

    /// Count evicted cache entries.
    pub fn add_cache_evictions(&self, policy: &str, entries: usize) {
        self.inner
            .cache_evictions_total
            .with_label_values(&[policy])
            .inc_by(entries as u64);
    }

    /// Count a staging wait by outcome (`online`, `timeout`, `cancelled`, `error`).
    pub fn inc_staging_request(&self, outcome: &str) {
        self.inner
            .staging_requests_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Render the metrics registry using the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be encoded or if the encoded
    /// buffer is not valid UTF-8.
    pub fn render(&self) -> TelemetryResult<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|source| TelemetryError::MetricsEncode { source })?;
        String::from_utf8(buffer).map_err(|source| TelemetryError::MetricsUtf8 { source })
    }

    /// Take a point-in-time snapshot of the most relevant gauges and counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_depth: self.inner.queue_depth.get(),
            operations_running: self.inner.operations_running.get(),
            bytes_processed_total: self.inner.bytes_processed_total.get(),
            operations_completed_total: self
                .inner
                .operations_total
                .with_label_values(&["completed"])
                .get(),
            operations_failed_total: self
                .inner
                .operations_total
                .with_label_values(&["failed"])
                .get(),
        }
    }
}

fn collector<C>(name: &'static str, built: prometheus::Result<C>) -> TelemetryResult<C> {
    built.map_err(|source| TelemetryError::Metric {
        name,
        stage: MetricStage::Build,
        source,
    })
}

fn register<C>(registry: &Registry, name: &'static str, collector: &C) -> TelemetryResult<()>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|source| TelemetryError::Metric {
            name,
            stage: MetricStage::Register,
            source,
        })
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_and_snapshot() -> anyhow::Result<()> {
        let metrics = Metrics::new()?;
        metrics.set_queue_depth(3);
        metrics.set_operations_running(2);
        metrics.inc_operation("completed");
        metrics.inc_operation("completed");
        metrics.inc_operation("failed");
        metrics.add_bytes_processed(512);
        metrics.set_cache_used_bytes("archive", 1_024);
        metrics.add_cache_evictions("lru", 2);
        metrics.inc_staging_request("online");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_depth, 3);
        assert_eq!(snapshot.operations_running, 2);
        assert_eq!(snapshot.operations_completed_total, 2);
        assert_eq!(snapshot.operations_failed_total, 1);
        assert_eq!(snapshot.bytes_processed_total, 512);

        let rendered = metrics.render()?;
        assert!(rendered.contains("stratum_queue_depth 3"));
        assert!(rendered.contains("stratum_cache_used_bytes{pool=\"archive\"} 1024"));
        assert!(rendered.contains("stratum_cache_evictions_total{policy=\"lru\"} 2"));
        assert!(rendered.contains("stratum_staging_requests_total{outcome=\"online\"} 1"));
        Ok(())
    }

    #[test]
    fn registries_are_independent() -> anyhow::Result<()> {
        let first = Metrics::new()?;
        let second = Metrics::new()?;
        first.set_queue_depth(7);
        assert_eq!(second.snapshot().queue_depth, 0);
        Ok(())
    }
}
