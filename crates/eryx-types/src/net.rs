//! Network egress policy configuration and host pattern matching.
//!
//! Grounded on the teacher's SSRF defenses (private/loopback blocking)
//! and glob-style capability matching, generalized into the policy the
//! spec describes: an allow-list evaluated after a deny-list, with
//! private ranges and loopback blocked by default even in permissive
//! mode.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// What to do with a destination that matches neither the deny-list nor
/// the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefaultPolicy {
    /// Reject everything not explicitly allow-listed.
    DenyAll,
    /// Accept anything not explicitly denied (private ranges still
    /// blocked unless `allow_private` is set).
    PermissiveBlockPrivate,
}

/// Network egress policy for one sandbox/session instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    /// Verdict for destinations matching neither list.
    pub default: DefaultPolicy,
    /// Host allow-list. Entries are either an exact host or a
    /// `*.suffix` wildcard matching one or more dot-separated labels.
    pub allow_hosts: Vec<String>,
    /// Whether `localhost`/`127.0.0.1`/`::1` are reachable even though
    /// they fall under the loopback deny rule.
    pub allow_localhost: bool,
    /// Whether RFC1918 private ranges and link-local addresses are
    /// reachable even though they fall under the private-range deny
    /// rule.
    pub allow_private: bool,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            default: DefaultPolicy::DenyAll,
            allow_hosts: Vec::new(),
            allow_localhost: false,
            allow_private: false,
        }
    }
}

impl NetConfig {
    /// Evaluate a destination `host` (hostname, no port) against this
    /// policy. Deny takes precedence over allow: an allow-listed host
    /// that also resolves to a private address is still denied unless
    /// `allow_private` is set.
    pub fn permits_host(&self, host: &str) -> bool {
        if is_loopback_hostname(host) && !self.allow_localhost {
            return false;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if !self.allow_private && is_private_or_loopback(&ip) {
                return false;
            }
        }
        if self.allow_hosts.iter().any(|pat| host_matches(pat, host)) {
            return true;
        }
        matches!(self.default, DefaultPolicy::PermissiveBlockPrivate)
    }

    /// Same as [`permits_host`](Self::permits_host) but also checks a
    /// resolved IP address, defeating DNS-rebinding style bypasses of a
    /// hostname-only check.
    pub fn permits_resolved(&self, host: &str, resolved: &[IpAddr]) -> bool {
        if !self.permits_host(host) {
            return false;
        }
        if self.allow_private {
            return true;
        }
        !resolved.iter().any(is_private_or_loopback)
    }
}

/// Match a host pattern: exact match, or `*.suffix` matching one or
/// more dot-separated labels ahead of `suffix`.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == host {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.len() > suffix.len() + 1
            && host.ends_with(suffix)
            && host[..host.len() - suffix.len()].ends_with('.');
    }
    false
}

fn is_loopback_hostname(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn is_private_or_loopback(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_unspecified() {
                return true;
            }
            let o = v4.octets();
            matches!(
                o,
                [10, ..] | [172, 16..=31, ..] | [192, 168, ..] | [169, 254, ..]
            )
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                return true;
            }
            let segs = v6.segments();
            (segs[0] & 0xfe00) == 0xfc00 || (segs[0] & 0xffc0) == 0xfe80
        }
    }
}
