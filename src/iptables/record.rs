use std::fmt;

use super::parse::ParseError;
use crate::watch::WorkloadIdentity;

/// Jump target of the rule that drops unmatched packets.
pub const DROP_TARGET: &str = "DROP";

/// Direction of a per-workload chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainType {
    /// `cali-tw-*`: traffic towards the workload.
    ToWorkload,
    /// `cali-fw-*`: traffic from the workload.
    FromWorkload,
}

impl ChainType {
    /// Parse the chain-type token of a workload chain name.
    pub fn from_token(token: &str) -> Result<Self, ParseError> {
        match token {
            "tw" => Ok(Self::ToWorkload),
            "fw" => Ok(Self::FromWorkload),
            other => Err(ParseError::UnsupportedGrammar {
                what: "chain type",
                token: other.to_string(),
            }),
        }
    }

    /// Returns the metric label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToWorkload => "tw",
            Self::FromWorkload => "fw",
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a policy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyDirection {
    /// `cali-pi-*`
    Inbound,
    /// `cali-po-*`
    Outbound,
}

impl PolicyDirection {
    /// Parse the direction token of a policy chain name.
    pub fn from_token(token: &str) -> Result<Self, ParseError> {
        match token {
            "i" => Ok(Self::Inbound),
            "o" => Ok(Self::Outbound),
            other => Err(ParseError::UnsupportedGrammar {
                what: "policy direction",
                token: other.to_string(),
            }),
        }
    }

    /// Chain name prefix for this direction.
    pub const fn chain_prefix(self) -> &'static str {
        match self {
            Self::Inbound => "cali-pi-",
            Self::Outbound => "cali-po-",
        }
    }
}

/// Outcome classifier of an accounting record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CountType {
    /// Packets dropped because no policy matched.
    Drop,
    /// Packets accepted by a policy.
    Accept,
    /// Accept count read back as zero, replaced by the count observed on the
    /// policy's drop chain in the same dump.
    AcceptFromDrop,
}

impl CountType {
    /// True for both acceptance variants.
    pub const fn is_accept(self) -> bool {
        matches!(self, Self::Accept | Self::AcceptFromDrop)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Accept => "accept",
            Self::AcceptFromDrop => "accept_from_drop",
        }
    }
}

/// One accept/drop observation for one workload and direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountingRecord {
    pub pod_name: String,
    pub namespace: String,
    pub app_label: String,
    /// Sorted, comma-joined workload IPs.
    pub pod_ip: String,
    pub chain_type: ChainType,
    pub count_type: CountType,
    pub packet_count: u64,
    /// For drops the literal `DROP`; for accepts the policy chain jumped to
    /// before the accept rule.
    pub target: String,
}

impl AccountingRecord {
    /// Build a record for `workload`, rejecting drops that do not jump to `DROP`.
    pub fn build(
        workload: &WorkloadIdentity,
        count_type: CountType,
        chain_type: ChainType,
        packet_count: u64,
        target: &str,
    ) -> Result<Self, ParseError> {
        if count_type == CountType::Drop && target != DROP_TARGET {
            return Err(ParseError::DropTargetMismatch {
                target: target.to_string(),
            });
        }

        let mut ips: Vec<&str> = workload.ips.iter().map(String::as_str).collect();
        ips.sort_unstable();

        Ok(Self {
            pod_name: workload.pod.clone(),
            namespace: workload.namespace.clone(),
            app_label: workload.app_label.clone(),
            pod_ip: ips.join(","),
            chain_type,
            count_type,
            packet_count,
            target: target.to_string(),
        })
    }
}
