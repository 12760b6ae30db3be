use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::export::MetricsServer;
use crate::iptables::IptablesSave;
use crate::metrics::Accountant;
use crate::watch::file::FileSyncer;
use crate::watch::node::resolve_node_name;
use crate::watch::{ResourceCache, Syncer};

/// Buffered sync events between the feed and the cache.
const SYNC_CHANNEL_CAPACITY: usize = 64;

/// Agent wires the resource cache, the snapshot feed and the metrics server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cache: Option<Arc<ResourceCache>>,
    server: Option<MetricsServer>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    fatal: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health = Arc::new(HealthMetrics::new().context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cache: None,
            server: None,
            local_addr: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
            fatal: CancellationToken::new(),
        })
    }

    /// Cancelled when the agent hits an error it must not survive.
    pub fn fatal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Start all components. Returns once the metrics server is listening;
    /// scrapes block until the cache has synced.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Resolve which node's workloads to account for.
        let node = resolve_node_name(
            self.cfg.node.name.as_deref(),
            self.cfg.node.hostname.as_deref(),
        )
        .context("resolving node name")?;
        info!(node = %node, "resolved node name");

        // 2. Start the resource cache and its feed.
        let cache = Arc::new(ResourceCache::new(node));
        let (tx, rx) = mpsc::channel(SYNC_CHANNEL_CAPACITY);

        let cache_task = {
            let cache = Arc::clone(&cache);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move { cache.run(rx, cancel).await })
        };
        self.tasks.push(cache_task);

        let syncer = FileSyncer::new(&self.cfg.sync);
        let sync_cancel = self.cancel.child_token();
        let sync_task = tokio::spawn(async move {
            if let Err(e) = syncer.run(tx, sync_cancel).await {
                error!(error = %e, "snapshot feed stopped");
            }
        });
        self.tasks.push(sync_task);

        // 3. Serve metrics. `/readyz` reports the sync gate, `/metrics`
        // waits on it.
        let accountant = Arc::new(Accountant::new(
            Arc::clone(&cache),
            IptablesSave::new(&self.cfg.iptables),
            self.cfg.minimum_counter,
            Arc::clone(&self.health),
        ));
        let server = MetricsServer::new(&self.cfg.metrics_addr, accountant, self.fatal.clone());
        let local_addr = server
            .start()
            .await
            .context("starting metrics server")?;

        // 4. Report when the first complete view has been delivered.
        let ready_task = {
            let cache = Arc::clone(&cache);
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = cache.await_ready() => {
                        info!(
                            node = cache.node(),
                            workloads = cache.workload_count(),
                            policy_chains = cache.policy_chain_count(),
                            "resource cache filled"
                        );
                    }
                }
            })
        };
        self.tasks.push(ready_task);

        self.cache = Some(cache);
        self.server = Some(server);
        self.local_addr = Some(local_addr);

        info!("agent fully started");

        Ok(())
    }

    /// Address the metrics server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        if let Some(server) = &self.server {
            server.stop().await?;
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "background task panicked");
            }
        }

        Ok(())
    }
}
