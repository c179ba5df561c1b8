//! Metrics collection for observability
//!
//! Prometheus metrics for the reconciliation pipeline, kept in a dedicated
//! registry so several pipelines (tests) can coexist in one process.
//!
//! # Metrics
//!
//! - `loyalty_orders_submitted_total` - Orders accepted into the queue
//! - `loyalty_queue_depth` - Tasks waiting in the queue
//! - `loyalty_accrual_attempts_total` - External lookups issued
//! - `loyalty_retry_budget_exhausted_total` - Lookups that ran out of budget
//! - `loyalty_tasks_requeued_total` - Tasks re-enqueued with an outer delay
//! - `loyalty_tasks_dropped_total` - Tasks dropped on fatal errors
//! - `loyalty_orders_resolved_total{status}` - Terminal transitions applied
//! - `loyalty_points_credited_total` - Hundredths of points credited
//! - `loyalty_withdrawals_total` - Successful withdrawals

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    pub orders_submitted: IntCounter,
    pub queue_depth: IntGauge,
    pub accrual_attempts: IntCounter,
    pub retry_budget_exhausted: IntCounter,
    pub tasks_requeued: IntCounter,
    pub tasks_dropped: IntCounter,
    pub orders_resolved: IntCounterVec,
    pub points_credited: IntCounter,
    pub withdrawals: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let orders_submitted = IntCounter::new(
            "loyalty_orders_submitted_total",
            "Orders accepted into the reconciliation queue",
        )?;
        registry.register(Box::new(orders_submitted.clone()))?;

        let queue_depth = IntGauge::new("loyalty_queue_depth", "Tasks waiting in the queue")?;
        registry.register(Box::new(queue_depth.clone()))?;

        let accrual_attempts = IntCounter::new(
            "loyalty_accrual_attempts_total",
            "Accrual service lookups issued",
        )?;
        registry.register(Box::new(accrual_attempts.clone()))?;

        let retry_budget_exhausted = IntCounter::new(
            "loyalty_retry_budget_exhausted_total",
            "Accrual queries that exhausted their backoff budget",
        )?;
        registry.register(Box::new(retry_budget_exhausted.clone()))?;

        let tasks_requeued = IntCounter::new(
            "loyalty_tasks_requeued_total",
            "Tasks re-enqueued with an outer delay",
        )?;
        registry.register(Box::new(tasks_requeued.clone()))?;

        let tasks_dropped = IntCounter::new(
            "loyalty_tasks_dropped_total",
            "Tasks dropped after a fatal error",
        )?;
        registry.register(Box::new(tasks_dropped.clone()))?;

        let orders_resolved = IntCounterVec::new(
            Opts::new(
                "loyalty_orders_resolved_total",
                "Terminal order transitions applied",
            ),
            &["status"],
        )?;
        registry.register(Box::new(orders_resolved.clone()))?;

        let points_credited = IntCounter::new(
            "loyalty_points_credited_total",
            "Hundredths of points credited to balances",
        )?;
        registry.register(Box::new(points_credited.clone()))?;

        let withdrawals = IntCounter::new("loyalty_withdrawals_total", "Successful withdrawals")?;
        registry.register(Box::new(withdrawals.clone()))?;

        Ok(Self {
            orders_submitted,
            queue_depth,
            accrual_attempts,
            retry_budget_exhausted,
            tasks_requeued,
            tasks_dropped,
            orders_resolved,
            points_credited,
            withdrawals,
            registry,
        })
    }

    /// Record a terminal transition
    pub fn record_resolution(&self, status: &str, credited_minor: i64) {
        self.orders_resolved.with_label_values(&[status]).inc();
        if credited_minor > 0 {
            self.points_credited.inc_by(credited_minor as u64);
        }
    }

    /// Render all metrics in the text exposition format
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_registries() {
        let first = Metrics::new().unwrap();
        let second = Metrics::new().unwrap();

        first.orders_submitted.inc();
        assert_eq!(first.orders_submitted.get(), 1);
        assert_eq!(second.orders_submitted.get(), 0);
    }

    #[test]
    fn test_render_contains_resolutions() {
        let metrics = Metrics::new().unwrap();
        metrics.record_resolution("PROCESSED", 50_000);
        metrics.record_resolution("INVALID", 0);

        let text = metrics.render().unwrap();
        assert!(text.contains("loyalty_orders_resolved_total{status=\"PROCESSED\"} 1"));
        assert!(text.contains("loyalty_points_credited_total 50000"));
    }
}
