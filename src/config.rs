use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the accountant.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Address the metrics server listens on. Default: ":9009".
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,

    /// Rounds whose largest packet count is below this value are discarded.
    /// Default: 0 (never discard).
    #[serde(default)]
    pub minimum_counter: u64,

    /// Node identity resolution inputs.
    #[serde(default)]
    pub node: NodeConfig,

    /// Counter dump command configuration.
    #[serde(default)]
    pub iptables: IptablesConfig,

    /// Resource snapshot feed configuration.
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Node identity resolution inputs.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct NodeConfig {
    /// Explicit node name. Takes precedence over everything else.
    #[serde(default)]
    pub name: Option<String>,

    /// Hostname hint, lower-cased and trimmed before use.
    #[serde(default)]
    pub hostname: Option<String>,
}

/// Counter dump command configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IptablesConfig {
    /// Executable producing the counter dump. Default: "iptables-save".
    #[serde(default = "default_iptables_command")]
    pub command: String,

    /// Arguments passed to the command. Default: ["-t", "filter", "-c"].
    #[serde(default = "default_iptables_args")]
    pub args: Vec<String>,

    /// Upper bound on one dump. Default: 10s.
    #[serde(default = "default_iptables_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Resource snapshot feed configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// YAML snapshot of workload endpoints and policies.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,

    /// How often the snapshot is re-read. Default: 10s.
    #[serde(default = "default_sync_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

// --- Serde default helpers ---

fn default_metrics_addr() -> String {
    ":9009".to_string()
}

fn default_iptables_command() -> String {
    "iptables-save".to_string()
}

fn default_iptables_args() -> Vec<String> {
    vec!["-t".to_string(), "filter".to_string(), "-c".to_string()]
}

fn default_iptables_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/etc/calico-accountant/snapshot.yaml")
}

fn default_sync_poll_interval() -> Duration {
    Duration::from_secs(10)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            metrics_addr: default_metrics_addr(),
            minimum_counter: 0,
            node: NodeConfig::default(),
            iptables: IptablesConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            command: default_iptables_command(),
            args: default_iptables_args(),
            timeout: default_iptables_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            poll_interval: default_sync_poll_interval(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from an optional YAML file, then apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str::<Config>(&data)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Apply `METRICS_SERVER_PORT`, `MINIMUM_COUNTER`, `NODENAME` and
    /// `HOSTNAME` from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup("METRICS_SERVER_PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .with_context(|| format!("parsing METRICS_SERVER_PORT {port:?}"))?;
            self.metrics_addr = format!(":{port}");
        }

        if let Some(min) = lookup("MINIMUM_COUNTER") {
            self.minimum_counter = min
                .trim()
                .parse()
                .with_context(|| format!("parsing MINIMUM_COUNTER {min:?}"))?;
        }

        if let Some(name) = lookup("NODENAME") {
            self.node.name = Some(name);
        }

        if let Some(hostname) = lookup("HOSTNAME") {
            self.node.hostname = Some(hostname);
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.metrics_addr.is_empty() {
            bail!("metrics_addr is required");
        }

        if self.iptables.command.is_empty() {
            bail!("iptables.command is required");
        }

        if self.iptables.timeout.is_zero() {
            bail!("iptables.timeout must be positive");
        }

        if self.sync.poll_interval.is_zero() {
            bail!("sync.poll_interval must be positive");
        }

        if self.sync.snapshot_path.as_os_str().is_empty() {
            bail!("sync.snapshot_path is required");
        }

        Ok(())
    }
}
