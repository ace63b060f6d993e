//! Prometheus metrics for reconciliation passes and NEG syncers

use anyhow::Result;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

pub const RESULT_SUCCESS: &str = "success";
pub const RESULT_ERROR: &str = "error";

/// Metrics shared by the cluster manager and every NEG syncer. Clones share
/// the registry.
#[derive(Clone)]
pub struct GlbcMetrics {
    /// Reconciliation passes by phase (checkpoint, gc, shutdown) and result
    pub reconcile_total: CounterVec,
    /// Reconciliation pass latency in seconds
    pub reconcile_duration_seconds: HistogramVec,
    /// NEG sync attempts by result
    pub neg_sync_total: CounterVec,
    /// Endpoint attach/detach batches by operation and result
    pub neg_endpoint_operations_total: CounterVec,
    /// Running NEG syncers
    pub neg_syncers: IntGauge,
    pub registry: Arc<Registry>,
}

impl GlbcMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let reconcile_total = CounterVec::new(
            Opts::new("glbc_reconcile_total", "Total reconciliation passes"),
            &["phase", "result"],
        )?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "glbc_reconcile_duration_seconds",
                "Reconciliation pass latency in seconds",
            ),
            &["phase"],
        )?;

        let neg_sync_total = CounterVec::new(
            Opts::new("glbc_neg_sync_total", "Total NEG sync attempts"),
            &["result"],
        )?;

        let neg_endpoint_operations_total = CounterVec::new(
            Opts::new(
                "glbc_neg_endpoint_operations_total",
                "Total network endpoint attach and detach batches",
            ),
            &["operation", "result"],
        )?;

        let neg_syncers = IntGauge::new("glbc_neg_syncers", "Running NEG syncers")?;

        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;
        registry.register(Box::new(neg_sync_total.clone()))?;
        registry.register(Box::new(neg_endpoint_operations_total.clone()))?;
        registry.register(Box::new(neg_syncers.clone()))?;

        Ok(Self {
            reconcile_total,
            reconcile_duration_seconds,
            neg_sync_total,
            neg_endpoint_operations_total,
            neg_syncers,
            registry,
        })
    }

    pub fn record_reconcile(&self, phase: &str, ok: bool, elapsed: Duration) {
        self.reconcile_total
            .with_label_values(&[phase, result_label(ok)])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[phase])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_neg_sync(&self, ok: bool) {
        self.neg_sync_total
            .with_label_values(&[result_label(ok)])
            .inc();
    }

    pub fn record_endpoint_operation(&self, operation: &str, ok: bool) {
        self.neg_endpoint_operations_total
            .with_label_values(&[operation, result_label(ok)])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

fn result_label(ok: bool) -> &'static str {
    if ok {
        RESULT_SUCCESS
    } else {
        RESULT_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = GlbcMetrics::new().unwrap();
        metrics.record_reconcile("checkpoint", true, Duration::from_millis(20));
        metrics.record_reconcile("gc", false, Duration::from_millis(5));
        metrics.record_neg_sync(true);
        metrics.record_endpoint_operation("attach", false);
        metrics.neg_syncers.inc();

        let output = metrics.gather().unwrap();
        assert!(output.contains("glbc_reconcile_total"));
        assert!(output.contains("phase=\"checkpoint\""));
        assert!(output.contains("glbc_neg_endpoint_operations_total"));
        assert!(output.contains("glbc_neg_syncers 1"));
    }

    #[test]
    fn test_clones_share_registry() {
        let metrics = GlbcMetrics::new().unwrap();
        let clone = metrics.clone();
        clone.record_neg_sync(false);
        assert_eq!(
            metrics
                .neg_sync_total
                .with_label_values(&[RESULT_ERROR])
                .get(),
            1.0
        );
    }
}
