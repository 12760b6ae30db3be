//! Scrape rounds: dump, parse, then either publish or discard the counters.

use std::sync::Arc;
use std::time::Instant;

use prometheus::proto::MetricFamily;
use prometheus::{IntCounterVec, Opts, Registry};
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::iptables::parse::InterfaceMap;
use crate::iptables::record::{AccountingRecord, CountType};
use crate::iptables::{ScanError, Scanner};
use crate::watch::ResourceCache;

pub const DROP_METRIC: &str = "no_policy_drop_counter";
pub const ACCEPT_METRIC: &str = "policy_accept_counter";

const DROP_LABELS: &[&str] = &["pod", "namespace", "app", "ip", "type"];
const ACCEPT_LABELS: &[&str] = &["pod", "namespace", "app", "ip", "type", "policy"];

/// Result of one scrape round.
#[derive(Debug)]
pub enum Round {
    /// Accounting families for this round.
    Published(Vec<MetricFamily>),
    /// Every counter was below the configured minimum; nothing is emitted.
    Suppressed { max_count: u64 },
}

/// Runs scrape rounds against the live counters and the resource cache.
pub struct Accountant<S> {
    cache: Arc<ResourceCache>,
    scanner: S,
    minimum_counter: u64,
    health: Arc<HealthMetrics>,
    /// Held for a whole round; overlapping scrapes queue behind it.
    round: tokio::sync::Mutex<()>,
}

impl<S: Scanner> Accountant<S> {
    pub fn new(
        cache: Arc<ResourceCache>,
        scanner: S,
        minimum_counter: u64,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            cache,
            scanner,
            minimum_counter,
            health,
            round: tokio::sync::Mutex::new(()),
        }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn health(&self) -> &HealthMetrics {
        &self.health
    }

    /// Run one round. Errors mean nothing was emitted for this round.
    pub async fn scrape(&self) -> Result<Round, ScanError> {
        let _round = self.round.lock().await;
        self.cache.await_ready().await;

        let start = Instant::now();
        let result = self.run_round().await;
        self.health
            .scrape_duration
            .observe(start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            self.health
                .scrape_errors
                .with_label_values(&[e.reason()])
                .inc();
        }

        result
    }

    async fn run_round(&self) -> Result<Round, ScanError> {
        let interfaces = self.interface_map();
        let records = self.scanner.scan(&interfaces).await?;

        self.health.scrape_records.set(records.len() as i64);
        self.health
            .workloads_tracked
            .set(self.cache.workload_count() as i64);
        self.health
            .policy_chains_tracked
            .set(self.cache.policy_chain_count() as i64);

        let max_count = records.iter().map(|r| r.packet_count).max().unwrap_or(0);
        if max_count < self.minimum_counter {
            warn!(
                max_count,
                minimum = self.minimum_counter,
                records = records.len(),
                "all counters below minimum, dropping scrape"
            );
            self.health.dropped_scrapes.inc();
            return Ok(Round::Suppressed { max_count });
        }

        Ok(Round::Published(self.render(&records)))
    }

    /// Interface name to workload, from a detached snapshot of the cache.
    fn interface_map(&self) -> InterfaceMap {
        self.cache
            .list_workloads()
            .into_iter()
            .map(|w| (w.interface.clone(), w))
            .collect()
    }

    /// Render records into counter families. Identical label sets within a
    /// round are summed.
    fn render(&self, records: &[AccountingRecord]) -> Vec<MetricFamily> {
        let (drops, accepts) = match new_round_vecs() {
            Ok(vecs) => vecs,
            Err(e) => {
                warn!(error = %e, "building round metrics");
                return Vec::new();
            }
        };

        for record in records {
            let chain_type = record.chain_type.as_str();
            match record.count_type {
                CountType::Drop => drops
                    .with_label_values(&[
                        record.pod_name.as_str(),
                        record.namespace.as_str(),
                        record.app_label.as_str(),
                        record.pod_ip.as_str(),
                        chain_type,
                    ])
                    .inc_by(record.packet_count),
                CountType::Accept | CountType::AcceptFromDrop => {
                    if record.count_type == CountType::AcceptFromDrop {
                        self.health.accepts_corrected.inc();
                    }
                    let policy = self.cache.policy_by_chain(&record.target);
                    if policy.is_empty() {
                        debug!(chain = %record.target, "no policy known for chain");
                    }
                    accepts
                        .with_label_values(&[
                            record.pod_name.as_str(),
                            record.namespace.as_str(),
                            record.app_label.as_str(),
                            record.pod_ip.as_str(),
                            chain_type,
                            policy.as_str(),
                        ])
                        .inc_by(record.packet_count);
                }
            }
        }

        let registry = Registry::new();
        if let Err(e) = registry
            .register(Box::new(drops))
            .and_then(|()| registry.register(Box::new(accepts)))
        {
            warn!(error = %e, "registering round metrics");
            return Vec::new();
        }

        // Empty families are skipped by gather.
        registry.gather()
    }
}

fn new_round_vecs() -> prometheus::Result<(IntCounterVec, IntCounterVec)> {
    let drops = IntCounterVec::new(
        Opts::new(
            DROP_METRIC,
            "Number of packets dropped to/from a workload because no policies matched them",
        ),
        DROP_LABELS,
    )?;
    let accepts = IntCounterVec::new(
        Opts::new(
            ACCEPT_METRIC,
            "Number of packets accepted by a policy on a workload",
        ),
        ACCEPT_LABELS,
    )?;
    Ok((drops, accepts))
}
