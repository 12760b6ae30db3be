//! Counter parsing for `iptables-save -c` output.
//!
//! The dump is scanned twice. The first pass records the packet count of
//! every policy chain that ends in an unconditional `DROP`. The second pass
//! walks the per-workload `cali-tw-*`/`cali-fw-*` chains and extracts the
//! "no policy matched" drop counters and the "policy accepted" return
//! counters, using the first pass to patch accept counters that read back
//! as zero.

use std::collections::HashMap;
use std::sync::LazyLock;

use memchr::memmem::Finder;
use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use super::record::{AccountingRecord, ChainType, CountType, PolicyDirection};
use crate::watch::WorkloadIdentity;

/// Interface name to workload, built once per scrape.
pub type InterfaceMap = HashMap<String, WorkloadIdentity>;

/// Comment carried by the rule dropping packets no policy accepted.
pub const DROP_MARKER: &[u8] = b"Drop if no policies passed packet";

/// Comment carried by the rule returning once a policy accepted a packet.
pub const ACCEPT_MARKER: &[u8] = b"Return if policy accepted";

static DROP_CHAIN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(-?\d+):\d+\] -A (cali-p([io])-\S+).*-j DROP$").expect("valid drop chain regex")
});

static ACCOUNTING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(-?\d+):\d+\] -A cali-([tf]w)-(\S+).*-j (\S+)$")
        .expect("valid accounting regex")
});

static DROP_FINDER: LazyLock<Finder<'static>> = LazyLock::new(|| Finder::new(DROP_MARKER));

static ACCEPT_FINDER: LazyLock<Finder<'static>> = LazyLock::new(|| Finder::new(ACCEPT_MARKER));

/// Errors raised while interpreting a single dump line.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid packet count {raw:?}")]
    InvalidCount { raw: String },

    #[error("drop count type but target is {target:?}, not DROP")]
    DropTargetMismatch { target: String },

    #[error("no workload for interface {iface:?}")]
    UnknownInterface { iface: String },

    /// The chain naming scheme does not match the expected grammar. Never
    /// skipped: tagging counters with a guessed direction would be wrong.
    #[error("unsupported {what} token {token:?}")]
    UnsupportedGrammar { what: &'static str, token: String },
}

impl ParseError {
    /// True if the error must abort the scrape instead of skipping the line.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedGrammar { .. })
    }
}

/// Count observed on a policy chain ending in `DROP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropChainObservation {
    pub direction: PolicyDirection,
    pub packet_count: u64,
}

/// Extract accounting records from a captured dump.
///
/// Malformed lines are logged and skipped. Only an unsupported chain grammar
/// fails the whole parse.
pub fn parse_from(
    dump: &[u8],
    interfaces: &InterfaceMap,
) -> Result<Vec<AccountingRecord>, ParseError> {
    let drop_chains = observe_drop_chains(dump)?;

    // At most a drop and an accept per direction per interface.
    let mut results = Vec::with_capacity(4 * interfaces.len());
    let mut last_target: Option<String> = None;

    for line in lines(dump) {
        let Some(caps) = ACCOUNTING_RE.captures(line) else {
            continue;
        };

        let packet_count = match parse_count(&caps[1]) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, line = %String::from_utf8_lossy(line), "skipping line");
                continue;
            }
        };

        let chain_type = ChainType::from_token(&lossy(&caps[2]))?;
        let target = lossy(&caps[4]);

        let is_drop = DROP_FINDER.find(line).is_some();
        let is_accept = ACCEPT_FINDER.find(line).is_some();

        if !is_drop && !is_accept {
            last_target = Some(target);
            continue;
        }

        let iface = lossy(&caps[3]);
        let Some(workload) = interfaces.get(&iface) else {
            let err = ParseError::UnknownInterface { iface };
            debug!(error = %err, "skipping line");
            continue;
        };

        let built = if is_drop {
            AccountingRecord::build(
                workload,
                CountType::Drop,
                chain_type,
                packet_count,
                &target,
            )
        } else {
            // The accept rule itself jumps to RETURN; the policy it accounts
            // for is the chain jumped to on the preceding rule.
            let policy_chain = last_target.as_deref().unwrap_or_default();
            let (count_type, packet_count) =
                correct_accept(packet_count, policy_chain, &drop_chains);
            if count_type == CountType::AcceptFromDrop {
                debug!(
                    chain = policy_chain,
                    packet_count, "accept counter read zero, using drop chain count"
                );
            }
            AccountingRecord::build(
                workload,
                count_type,
                chain_type,
                packet_count,
                policy_chain,
            )
        };

        match built {
            Ok(record) => results.push(record),
            Err(e) => {
                warn!(error = %e, line = %String::from_utf8_lossy(line), "error building result");
            }
        }
    }

    Ok(results)
}

/// First pass: packet counts of policy chains ending in an unconditional drop.
/// A later line for the same chain replaces an earlier one.
pub fn observe_drop_chains(
    dump: &[u8],
) -> Result<HashMap<String, DropChainObservation>, ParseError> {
    let mut chains = HashMap::new();

    for line in lines(dump) {
        let Some(caps) = DROP_CHAIN_RE.captures(line) else {
            continue;
        };

        let packet_count = match parse_count(&caps[1]) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, line = %String::from_utf8_lossy(line), "skipping drop chain");
                continue;
            }
        };

        let direction = PolicyDirection::from_token(&lossy(&caps[3]))?;

        chains.insert(
            lossy(&caps[2]),
            DropChainObservation {
                direction,
                packet_count,
            },
        );
    }

    Ok(chains)
}

/// Substitute a zero accept count with the non-zero count seen on the
/// policy's drop chain in the same dump.
fn correct_accept(
    packet_count: u64,
    policy_chain: &str,
    drop_chains: &HashMap<String, DropChainObservation>,
) -> (CountType, u64) {
    if packet_count == 0 {
        if let Some(obs) = drop_chains.get(policy_chain) {
            if obs.packet_count > 0 {
                return (CountType::AcceptFromDrop, obs.packet_count);
            }
        }
    }
    (CountType::Accept, packet_count)
}

/// Counts must be non-negative and fit a signed 64-bit integer.
fn parse_count(raw: &[u8]) -> Result<u64, ParseError> {
    let text = lossy(raw);
    match text.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(n as u64),
        _ => Err(ParseError::InvalidCount { raw: text }),
    }
}

fn lines(dump: &[u8]) -> impl Iterator<Item = &[u8]> {
    dump.split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
