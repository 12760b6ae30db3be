pub mod parse;
pub mod record;

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, error};

use crate::config::IptablesConfig;

use self::parse::{InterfaceMap, ParseError};
use self::record::AccountingRecord;

/// Errors that abort a whole scrape round.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("starting {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} has no stdout pipe")]
    NoStdout { command: String },

    #[error("reading {command} output: {source}")]
    Read {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("waiting for {command}: {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed: {status}")]
    ExitStatus { command: String, status: ExitStatus },

    #[error("parsing counter dump: {0}")]
    Parse(#[from] ParseError),
}

impl ScanError {
    /// True if the process must not keep running after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Parse(e) if e.is_fatal())
    }

    /// Short label for error metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Spawn { .. } | Self::NoStdout { .. } => "spawn",
            Self::Read { .. } => "read",
            Self::Timeout { .. } => "timeout",
            Self::Wait { .. } | Self::ExitStatus { .. } => "exit",
            Self::Parse(_) => "parse",
        }
    }
}

/// Produces accounting records from the live packet filter counters.
pub trait Scanner: Send + Sync {
    /// Dump the counters and parse them against `interfaces`.
    fn scan(
        &self,
        interfaces: &InterfaceMap,
    ) -> impl std::future::Future<Output = Result<Vec<AccountingRecord>, ScanError>> + Send;
}

/// Runs `iptables-save` (or a configured equivalent) as a subprocess.
#[derive(Debug, Clone)]
pub struct IptablesSave {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl IptablesSave {
    pub fn new(cfg: &IptablesConfig) -> Self {
        Self {
            command: cfg.command.clone(),
            args: cfg.args.clone(),
            timeout: cfg.timeout,
        }
    }

    /// Read the child's stdout to completion.
    async fn capture(&self, child: &mut Child) -> Result<Vec<u8>, ScanError> {
        let mut stdout = child.stdout.take().ok_or_else(|| ScanError::NoStdout {
            command: self.command.clone(),
        })?;

        let mut buf = Vec::with_capacity(64 * 1024);
        match tokio::time::timeout(self.timeout, stdout.read_to_end(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(source)) => Err(ScanError::Read {
                command: self.command.clone(),
                source,
            }),
            Err(_) => Err(ScanError::Timeout {
                command: self.command.clone(),
                timeout: self.timeout,
            }),
        }
    }

    async fn kill(&self, child: &mut Child) {
        if let Err(e) = child.kill().await {
            error!(command = %self.command, error = %e, "failed to kill dump process");
        }
    }
}

impl Scanner for IptablesSave {
    async fn scan(&self, interfaces: &InterfaceMap) -> Result<Vec<AccountingRecord>, ScanError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ScanError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        let dump = match self.capture(&mut child).await {
            Ok(dump) => dump,
            Err(e) => {
                self.kill(&mut child).await;
                return Err(e);
            }
        };

        debug!(bytes = dump.len(), "captured counter dump");

        let records = match parse::parse_from(&dump, interfaces) {
            Ok(records) => records,
            Err(e) => {
                self.kill(&mut child).await;
                return Err(e.into());
            }
        };

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(ScanError::Wait {
                    command: self.command.clone(),
                    source,
                })
            }
            Err(_) => {
                self.kill(&mut child).await;
                return Err(ScanError::Timeout {
                    command: self.command.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !status.success() {
            return Err(ScanError::ExitStatus {
                command: self.command.clone(),
                status,
            });
        }

        Ok(records)
    }
}
