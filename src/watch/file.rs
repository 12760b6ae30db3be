use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{PolicyId, SyncEvent, Syncer, Update, WorkloadEndpoint};
use crate::config::SyncConfig;

/// On-disk snapshot of the synced resources.
#[derive(Debug, Default, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub workload_endpoints: Vec<SnapshotEndpoint>,
    #[serde(default)]
    pub policies: Vec<PolicyId>,
}

/// Workload endpoint entry with an optional explicit key.
#[derive(Debug, Deserialize)]
pub struct SnapshotEndpoint {
    #[serde(default)]
    pub key: String,
    #[serde(flatten)]
    pub endpoint: WorkloadEndpoint,
}

impl SnapshotEndpoint {
    /// Explicit key, or `namespace/pod/interface`.
    fn resource_key(&self) -> String {
        if !self.key.is_empty() {
            return self.key.clone();
        }
        format!(
            "{}/{}/{}",
            self.endpoint.namespace, self.endpoint.pod, self.endpoint.interface_name
        )
    }
}

impl Snapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        serde_yaml::from_str(&data).with_context(|| format!("parsing snapshot {}", path.display()))
    }
}

/// Resource state last delivered downstream.
#[derive(Debug, Default)]
struct Delivered {
    workloads: HashMap<String, WorkloadEndpoint>,
    policies: BTreeSet<PolicyId>,
}

impl Delivered {
    /// Updates turning the delivered state into `snapshot`, and record it.
    fn diff(&mut self, snapshot: Snapshot) -> Vec<Update> {
        let mut updates = Vec::new();

        let mut workloads = HashMap::with_capacity(snapshot.workload_endpoints.len());
        for entry in snapshot.workload_endpoints {
            workloads.insert(entry.resource_key(), entry.endpoint);
        }
        let policies: BTreeSet<PolicyId> = snapshot.policies.into_iter().collect();

        for key in self.workloads.keys() {
            if !workloads.contains_key(key) {
                updates.push(Update::DeleteWorkload { key: key.clone() });
            }
        }
        for (key, endpoint) in &workloads {
            if self.workloads.get(key) != Some(endpoint) {
                updates.push(Update::UpsertWorkload {
                    key: key.clone(),
                    endpoint: endpoint.clone(),
                });
            }
        }

        for id in self.policies.difference(&policies) {
            updates.push(Update::DeletePolicy { id: id.clone() });
        }
        for id in policies.difference(&self.policies) {
            updates.push(Update::UpsertPolicy { id: id.clone() });
        }

        self.workloads = workloads;
        self.policies = policies;

        updates
    }
}

/// Polls a YAML snapshot file and feeds the differences to the cache.
pub struct FileSyncer {
    path: PathBuf,
    poll_interval: Duration,
    delivered: Delivered,
}

impl FileSyncer {
    pub fn new(cfg: &SyncConfig) -> Self {
        Self {
            path: cfg.snapshot_path.clone(),
            poll_interval: cfg.poll_interval,
            delivered: Delivered::default(),
        }
    }

    /// Load the snapshot and compute pending updates.
    fn poll(&mut self) -> Result<Vec<Update>> {
        let snapshot = Snapshot::load(&self.path)?;
        Ok(self.delivered.diff(snapshot))
    }
}

impl Syncer for FileSyncer {
    async fn run(mut self, tx: mpsc::Sender<SyncEvent>, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut in_sync = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    let updates = match self.poll() {
                        Ok(updates) => updates,
                        Err(e) => {
                            warn!(path = %self.path.display(), error = %e, "snapshot poll failed");
                            continue;
                        }
                    };

                    if !updates.is_empty() {
                        debug!(count = updates.len(), "delivering snapshot updates");
                        if tx.send(SyncEvent::Updates(updates)).await.is_err() {
                            return Ok(());
                        }
                    }

                    if !in_sync {
                        in_sync = true;
                        info!(path = %self.path.display(), "initial snapshot delivered");
                        if tx.send(SyncEvent::InSync).await.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SNAPSHOT: &str = r#"
workload_endpoints:
  - pod: foo
    namespace: default
    node: node-a
    interface_name: cali5125b8e5d77
    ip_networks: ["127.0.0.1/32"]
    labels:
      app: bar
  - key: explicit-key
    pod: baz
    node: node-b
    interface_name: cali0000000001
policies:
  - name: allow-frontend
  - tier: default
    name: allow-dns
"#;

    #[test]
    fn test_snapshot_parses() {
        let snapshot: Snapshot = serde_yaml::from_str(SNAPSHOT).unwrap();
        assert_eq!(snapshot.workload_endpoints.len(), 2);
        assert_eq!(
            snapshot.workload_endpoints[0].resource_key(),
            "default/foo/cali5125b8e5d77"
        );
        assert_eq!(snapshot.workload_endpoints[1].resource_key(), "explicit-key");
        assert_eq!(snapshot.policies[0], PolicyId::new("allow-frontend"));
    }

    #[test]
    fn test_diff_emits_only_changes() {
        let mut delivered = Delivered::default();

        let first = delivered.diff(serde_yaml::from_str(SNAPSHOT).unwrap());
        assert_eq!(first.len(), 4);

        let second = delivered.diff(serde_yaml::from_str(SNAPSHOT).unwrap());
        assert!(second.is_empty());

        let third = delivered.diff(
            serde_yaml::from_str(
                r#"
workload_endpoints:
  - key: explicit-key
    pod: baz
    node: node-a
    interface_name: cali0000000001
policies:
  - name: allow-dns
"#,
            )
            .unwrap(),
        );
        assert!(third.contains(&Update::DeleteWorkload {
            key: "default/foo/cali5125b8e5d77".to_string()
        }));
        assert!(third.contains(&Update::DeletePolicy {
            id: PolicyId::new("allow-frontend")
        }));
        assert!(third
            .iter()
            .any(|u| matches!(u, Update::UpsertWorkload { key, .. } if key == "explicit-key")));
        assert_eq!(third.len(), 3);
    }

    #[tokio::test]
    async fn test_run_delivers_updates_then_in_sync() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SNAPSHOT.as_bytes()).unwrap();

        let syncer = FileSyncer::new(&SyncConfig {
            snapshot_path: file.path().to_path_buf(),
            poll_interval: Duration::from_secs(60),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(syncer.run(tx, cancel.clone()));

        match rx.recv().await {
            Some(SyncEvent::Updates(updates)) => assert_eq!(updates.len(), 4),
            other => panic!("expected updates, got {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(SyncEvent::InSync));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
