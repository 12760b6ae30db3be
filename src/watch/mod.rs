//! Local cache of workload endpoints and policy chains.
//!
//! Fed by a push stream of [`SyncEvent`]s from a [`Syncer`]. Readers get
//! copies; locks are only held for one key mutation or one snapshot.

pub mod chain;
pub mod file;
pub mod node;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tier every policy is rendered in.
pub const DEFAULT_TIER: &str = "default";

/// Label holding the application name of a workload.
const APP_LABEL: &str = "app";

/// Identifies a policy across the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct PolicyId {
    #[serde(default = "default_tier")]
    pub tier: String,
    pub name: String,
}

impl PolicyId {
    /// Policy in the default tier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tier: DEFAULT_TIER.to_string(),
            name: name.into(),
        }
    }
}

fn default_tier() -> String {
    DEFAULT_TIER.to_string()
}

/// Workload endpoint as delivered by the sync feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WorkloadEndpoint {
    pub pod: String,
    #[serde(default)]
    pub namespace: String,
    pub node: String,
    pub interface_name: String,
    #[serde(default)]
    pub ip_networks: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A workload scheduled on this node, keyed by its host-side interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
    pub key: String,
    pub pod: String,
    pub namespace: String,
    /// Value of the `app` label, empty if unset.
    pub app_label: String,
    pub interface: String,
    /// Workload addresses with any `/32` host mask removed.
    pub ips: Vec<String>,
    pub node: String,
}

impl WorkloadIdentity {
    pub fn from_endpoint(key: impl Into<String>, ep: &WorkloadEndpoint) -> Self {
        Self {
            key: key.into(),
            pod: ep.pod.clone(),
            namespace: ep.namespace.clone(),
            app_label: ep.labels.get(APP_LABEL).cloned().unwrap_or_default(),
            interface: ep.interface_name.clone(),
            ips: ep
                .ip_networks
                .iter()
                .map(|ip| ip.strip_suffix("/32").unwrap_or(ip).to_string())
                .collect(),
            node: ep.node.clone(),
        }
    }
}

/// One change to a synced resource.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    UpsertWorkload {
        key: String,
        endpoint: WorkloadEndpoint,
    },
    DeleteWorkload {
        key: String,
    },
    UpsertPolicy {
        id: PolicyId,
    },
    DeletePolicy {
        id: PolicyId,
    },
}

/// Message on the sync feed.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Changes in arrival order.
    Updates(Vec<Update>),
    /// The initial listing has been fully delivered.
    InSync,
}

/// Source of the sync feed. Owns its own retry and reconnect behaviour.
pub trait Syncer: Send {
    fn run(
        self,
        tx: mpsc::Sender<SyncEvent>,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Queryable view of local workloads and policy chains.
pub struct ResourceCache {
    node: String,
    /// Resource key -> workload.
    workloads: RwLock<HashMap<String, WorkloadIdentity>>,
    /// Chain name -> policy name.
    policies: RwLock<HashMap<String, String>>,
    ready: tokio::sync::watch::Sender<bool>,
}

impl ResourceCache {
    /// Create an empty cache retaining only workloads bound to `node`.
    pub fn new(node: impl Into<String>) -> Self {
        let (ready, _) = tokio::sync::watch::channel(false);
        Self {
            node: node.into(),
            workloads: RwLock::new(HashMap::new()),
            policies: RwLock::new(HashMap::new()),
            ready,
        }
    }

    /// Node whose workloads are retained.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Copy of every known local workload.
    pub fn list_workloads(&self) -> Vec<WorkloadIdentity> {
        self.workloads.read().values().cloned().collect()
    }

    /// Policy name enforced by `chain`, empty if unknown.
    pub fn policy_by_chain(&self, chain: &str) -> String {
        self.policies.read().get(chain).cloned().unwrap_or_default()
    }

    pub fn workload_count(&self) -> usize {
        self.workloads.read().len()
    }

    pub fn policy_chain_count(&self) -> usize {
        self.policies.read().len()
    }

    /// True once the first full sync has completed.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the first full sync has completed.
    pub async fn await_ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Apply one feed message.
    pub fn handle(&self, event: SyncEvent) {
        match event {
            SyncEvent::Updates(updates) => {
                for update in updates {
                    self.apply(update);
                }
            }
            SyncEvent::InSync => self.mark_ready(),
        }
    }

    /// Apply a single update.
    pub fn apply(&self, update: Update) {
        match update {
            Update::UpsertWorkload { key, endpoint } => {
                if endpoint.node != self.node {
                    return;
                }
                debug!(key = %key, iface = %endpoint.interface_name, "adding workload");
                let identity = WorkloadIdentity::from_endpoint(key.clone(), &endpoint);
                self.workloads.write().insert(key, identity);
            }
            Update::DeleteWorkload { key } => {
                if self.workloads.write().remove(&key).is_some() {
                    debug!(key = %key, "removing workload");
                }
            }
            Update::UpsertPolicy { id } => {
                let [inbound, outbound] = chain::policy_chain_names(&id);
                debug!(
                    policy = %id.name,
                    inbound = %inbound,
                    outbound = %outbound,
                    "storing policy chains"
                );
                let mut policies = self.policies.write();
                policies.insert(inbound, id.name.clone());
                policies.insert(outbound, id.name);
            }
            Update::DeletePolicy { id } => {
                let [inbound, outbound] = chain::policy_chain_names(&id);
                debug!(policy = %id.name, "removing policy chains");
                let mut policies = self.policies.write();
                policies.remove(&inbound);
                policies.remove(&outbound);
            }
        }
    }

    /// Open the readiness gate. Later calls are no-ops.
    fn mark_ready(&self) {
        let opened = self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });
        if opened {
            info!(
                workloads = self.workload_count(),
                policy_chains = self.policy_chain_count(),
                "resource cache in sync"
            );
        }
    }

    /// Consume the feed until it closes or `cancel` fires.
    pub async fn run(&self, mut rx: mpsc::Receiver<SyncEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        warn!("sync feed closed, cache will no longer update");
                        return;
                    }
                },
            }
        }
    }
}
