use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha224};

use super::PolicyId;
use crate::iptables::record::PolicyDirection;

/// Longest chain name the rule generator emits.
pub const MAX_CHAIN_NAME_LENGTH: usize = 28;

/// Marks a suffix that was replaced by its hash.
const SHORTENED_PREFIX: &str = "_";

/// Name of the chain enforcing `id` in the given direction.
pub fn policy_chain_name(direction: PolicyDirection, id: &PolicyId) -> String {
    let suffix = format!("{}/{}", id.tier, id.name);
    length_limited_id(direction.chain_prefix(), &suffix, MAX_CHAIN_NAME_LENGTH)
}

/// Both chain names of a policy, inbound first.
pub fn policy_chain_names(id: &PolicyId) -> [String; 2] {
    [
        policy_chain_name(PolicyDirection::Inbound, id),
        policy_chain_name(PolicyDirection::Outbound, id),
    ]
}

/// `prefix + suffix` if it fits in `max_len`, otherwise `prefix + "_" +`
/// a truncated URL-safe SHA-224 of the suffix. Suffixes already starting with
/// `_` are always hashed so they cannot collide with a shortened name.
pub fn length_limited_id(prefix: &str, suffix: &str, max_len: usize) -> String {
    if prefix.len() + suffix.len() <= max_len && !suffix.starts_with(SHORTENED_PREFIX) {
        return format!("{prefix}{suffix}");
    }

    let hash = URL_SAFE_NO_PAD.encode(Sha224::digest(suffix.as_bytes()));
    let room = max_len.saturating_sub(prefix.len() + SHORTENED_PREFIX.len());
    let take = room.min(hash.len());

    format!("{prefix}{SHORTENED_PREFIX}{}", &hash[..take])
}
