use thiserror::Error;
use tracing::debug;

/// Kernel hostname as seen from inside the agent's UTS namespace.
const SYSTEM_HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

#[derive(Error, Debug)]
pub enum NodeNameError {
    #[error("reading system hostname: {0}")]
    Hostname(#[from] std::io::Error),

    #[error("no node name: override and hostname hint unset, system hostname empty")]
    Empty,
}

/// Resolve the node this agent accounts for.
///
/// Must agree with the node name the CNI writes into workload endpoints:
/// explicit override first (even if empty), then the lower-cased hostname
/// hint, then the system hostname.
pub fn resolve_node_name(
    node_override: Option<&str>,
    hostname_hint: Option<&str>,
) -> Result<String, NodeNameError> {
    resolve_with(node_override, hostname_hint, || {
        std::fs::read_to_string(SYSTEM_HOSTNAME_PATH)
    })
}

fn resolve_with(
    node_override: Option<&str>,
    hostname_hint: Option<&str>,
    system_hostname: impl FnOnce() -> std::io::Result<String>,
) -> Result<String, NodeNameError> {
    // A present override wins even when empty.
    if let Some(name) = node_override {
        debug!(node = name, "using node name override");
        return Ok(name.to_string());
    }

    if let Some(name) = hostname_hint
        .map(|h| h.trim().to_lowercase())
        .filter(|h| !h.is_empty())
    {
        debug!(node = %name, "using hostname hint as node name");
        return Ok(name);
    }

    let name = system_hostname()?.trim().to_string();
    if name.is_empty() {
        return Err(NodeNameError::Empty);
    }

    debug!(node = %name, "using system hostname as node name");
    Ok(name)
}
