use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

/// Namespace of the accountant's own diagnostic metrics.
const NAMESPACE: &str = "calico_accountant";

/// Prometheus metrics describing the accountant itself.
///
/// Accounting samples are produced fresh each round and are not held here;
/// this registry only carries state that persists across rounds.
pub struct HealthMetrics {
    registry: Registry,

    /// Rounds discarded because every counter was below the minimum.
    pub dropped_scrapes: IntCounter,
    /// Rounds that failed, by reason (spawn/read/timeout/exit/parse).
    pub scrape_errors: IntCounterVec,
    /// Wall time of a full scrape round.
    pub scrape_duration: Histogram,
    /// Records produced by the last round.
    pub scrape_records: IntGauge,
    /// Zero accept counters replaced by the matching drop chain count.
    pub accepts_corrected: IntCounter,
    /// Local workloads in the resource cache.
    pub workloads_tracked: IntGauge,
    /// Policy chain names in the resource cache.
    pub policy_chains_tracked: IntGauge,
}

impl HealthMetrics {
    /// Creates and registers all diagnostic metrics.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let dropped_scrapes = IntCounter::with_opts(
            Opts::new(
                "dropped_scrapes_total",
                "Scrape rounds discarded because the largest counter was below the minimum.",
            )
            .namespace(NAMESPACE),
        )?;
        let scrape_errors = IntCounterVec::new(
            Opts::new("scrape_errors_total", "Failed scrape rounds by reason.")
                .namespace(NAMESPACE),
            &["reason"],
        )?;
        let scrape_duration = Histogram::with_opts(
            HistogramOpts::new("scrape_duration_seconds", "Duration of a scrape round.")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let scrape_records = IntGauge::with_opts(
            Opts::new(
                "scrape_records",
                "Accounting records produced by the last scrape round.",
            )
            .namespace(NAMESPACE),
        )?;
        let accepts_corrected = IntCounter::with_opts(
            Opts::new(
                "accepts_corrected_total",
                "Zero accept counters replaced by the count observed on the policy drop chain.",
            )
            .namespace(NAMESPACE),
        )?;
        let workloads_tracked = IntGauge::with_opts(
            Opts::new("workloads_tracked", "Local workloads in the resource cache.")
                .namespace(NAMESPACE),
        )?;
        let policy_chains_tracked = IntGauge::with_opts(
            Opts::new(
                "policy_chains_tracked",
                "Policy chain names in the resource cache.",
            )
            .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(dropped_scrapes.clone()))?;
        registry.register(Box::new(scrape_errors.clone()))?;
        registry.register(Box::new(scrape_duration.clone()))?;
        registry.register(Box::new(scrape_records.clone()))?;
        registry.register(Box::new(accepts_corrected.clone()))?;
        registry.register(Box::new(workloads_tracked.clone()))?;
        registry.register(Box::new(policy_chains_tracked.clone()))?;

        Ok(Self {
            registry,
            dropped_scrapes,
            scrape_errors,
            scrape_duration,
            scrape_records,
            accepts_corrected,
            workloads_tracked,
            policy_chains_tracked,
        })
    }

    /// Registry holding the diagnostic metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_under_namespace() {
        let health = HealthMetrics::new().unwrap();
        health.dropped_scrapes.inc();
        health.scrape_errors.with_label_values(&["spawn"]).inc();

        let names: Vec<String> = health
            .registry()
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();
        assert!(names.contains(&"calico_accountant_dropped_scrapes_total".to_string()));
        assert!(names.contains(&"calico_accountant_scrape_errors_total".to_string()));
    }
}
