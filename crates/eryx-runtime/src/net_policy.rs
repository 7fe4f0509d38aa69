//! Network egress enforcer — evaluates guest-initiated connect/open
//! calls against a `NetConfig` (spec §4.4).
//!
//! The policy itself (deny/allow precedence, host pattern matching) is
//! `eryx_types::NetConfig`; this module is the thin enforcement layer
//! that denies with no partial opens and folds per-secret host
//! allow-lists into the same check path used by the vault.

use std::net::IpAddr;

use eryx_types::{EryxError, EryxResult, NetConfig};

#[derive(Clone)]
pub struct NetPolicy {
    config: NetConfig,
}

impl NetPolicy {
    pub fn new(config: NetConfig) -> Self {
        Self { config }
    }

    /// Evaluate one connect/open attempt. No partial opens: either this
    /// returns `Ok(())` before any socket work begins, or the caller
    /// must not proceed at all.
    pub fn check(&self, host: &str, port: u16, resolved: &[IpAddr]) -> EryxResult<()> {
        if !self.config.permits_resolved(host, resolved) {
            return Err(EryxError::Policy(format!(
                "network egress denied: {host}:{port}"
            )));
        }
        Ok(())
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eryx_types::DefaultPolicy;

    #[test]
    fn deny_all_default_blocks_unlisted_host() {
        let policy = NetPolicy::new(NetConfig {
            default: DefaultPolicy::DenyAll,
            allow_hosts: vec!["api.openai.com".into()],
            ..NetConfig::default()
        });
        assert!(policy.check("api.openai.com", 443, &[]).is_ok());
        assert!(policy.check("evil.com", 443, &[]).is_err());
    }

    #[test]
    fn dns_rebind_to_private_ip_is_denied() {
        let policy = NetPolicy::new(NetConfig {
            default: DefaultPolicy::DenyAll,
            allow_hosts: vec!["evil.example.com".into()],
            ..NetConfig::default()
        });
        let resolved: Vec<IpAddr> = vec!["169.254.169.254".parse().unwrap()];
        assert!(policy.check("evil.example.com", 80, &resolved).is_err());
    }
}
