//! Secrets Vault — placeholder issuance, host-allow-listed rewriting,
//! and the scrub table the I/O Pumps search against.
//!
//! Grounded on the teacher's `env_read` capability check
//! (`host_functions::host_env_read`) generalized so the guest never
//! observes a raw value: reads return a placeholder, and only a
//! callback handler that explicitly asks for the raw value (and whose
//! destination host clears the secret's own allow-list) gets it back.

use std::collections::HashMap;

use eryx_types::{EryxError, EryxResult, Secret};

/// Holds every secret bound into one Sandbox/Session instance.
pub struct SecretsVault {
    by_name: HashMap<String, Secret>,
    by_placeholder: HashMap<String, String>,
    /// Whether scrubbing may be disabled for debugging (spec §4.3).
    scrub_enabled: bool,
}

impl SecretsVault {
    pub fn new(scrub_enabled: bool) -> Self {
        Self {
            by_name: HashMap::new(),
            by_placeholder: HashMap::new(),
            scrub_enabled,
        }
    }

    /// Bind a secret, generating a fresh placeholder. Returns the
    /// placeholder the guest will see in place of the raw value.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>, allow_hosts: Option<Vec<String>>) -> String {
        let name = name.into();
        let placeholder = eryx_types::secret::generate_placeholder();
        let secret = Secret {
            name: name.clone(),
            value: zeroize::Zeroizing::new(value.into()),
            placeholder: placeholder.clone(),
            allow_hosts,
        };
        self.by_placeholder.insert(placeholder.clone(), name.clone());
        self.by_name.insert(name, secret);
        placeholder
    }

    /// What the guest sees when it reads environment-variable-like name
    /// `name`: the placeholder, never the raw value.
    pub fn placeholder_for(&self, name: &str) -> Option<&str> {
        self.by_name.get(name).map(|s| s.placeholder.as_str())
    }

    /// Rewrite every placeholder occurring in `text` back to its raw
    /// value, but only for secrets whose allow-list admits
    /// `destination_host`. A secret with no matching host is left as
    /// its placeholder — the caller-visible text never gets the raw
    /// value in that case (spec §4.3: "a miss removes the secret
    /// before the handler sees the request").
    pub fn rewrite_for_destination(&self, text: &str, destination_host: &str) -> String {
        let mut out = text.to_string();
        for (placeholder, name) in &self.by_placeholder {
            if !out.contains(placeholder.as_str()) {
                continue;
            }
            let secret = &self.by_name[name];
            let permitted = match &secret.allow_hosts {
                None => true,
                Some(hosts) => hosts
                    .iter()
                    .any(|h| eryx_types::net::host_matches(h, destination_host)),
            };
            if permitted {
                out = out.replace(placeholder.as_str(), &secret.value);
            }
        }
        out
    }

    /// Validates a raw rewrite is permitted for `destination_host`
    /// without performing the substitution — used by callback handlers
    /// that need the value as a typed field rather than embedded text
    /// (e.g. an `Authorization` header).
    pub fn raw_value_for(&self, name: &str, destination_host: &str) -> EryxResult<Option<String>> {
        let Some(secret) = self.by_name.get(name) else {
            return Ok(None);
        };
        let permitted = match &secret.allow_hosts {
            None => true,
            Some(hosts) => hosts
                .iter()
                .any(|h| eryx_types::net::host_matches(h, destination_host)),
        };
        if !permitted {
            return Err(EryxError::Policy(format!(
                "secret '{name}' is not allow-listed for host '{destination_host}'"
            )));
        }
        Ok(Some(secret.value.to_string()))
    }

    /// Scrub table view for the I/O Pumps: every bound placeholder maps
    /// to the literal replacement text. Empty (no-op) when scrubbing is
    /// disabled or no secrets are bound.
    pub fn scrub_table(&self) -> Vec<&str> {
        if !self.scrub_enabled {
            return Vec::new();
        }
        self.by_placeholder.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn longest_placeholder_len(&self) -> usize {
        self.by_placeholder.keys().map(|p| p.len()).max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_yields_distinct_placeholder_not_equal_to_value() {
        let mut vault = SecretsVault::new(true);
        let p = vault.bind("TOKEN", "sk-abc", None);
        assert_ne!(p, "sk-abc");
        assert_eq!(vault.placeholder_for("TOKEN"), Some(p.as_str()));
    }

    #[test]
    fn rewrite_only_for_allow_listed_host() {
        let mut vault = SecretsVault::new(true);
        let p = vault.bind("TOKEN", "sk-abc", Some(vec!["api.example.com".into()]));
        let text = format!("Authorization: Bearer {p}");

        let rewritten_ok = vault.rewrite_for_destination(&text, "api.example.com");
        assert!(rewritten_ok.contains("sk-abc"));

        let rewritten_denied = vault.rewrite_for_destination(&text, "evil.com");
        assert!(!rewritten_denied.contains("sk-abc"));
        assert!(rewritten_denied.contains(&p));
    }

    #[test]
    fn raw_value_for_errors_on_disallowed_host() {
        let mut vault = SecretsVault::new(true);
        vault.bind("TOKEN", "sk-abc", Some(vec!["api.example.com".into()]));
        let err = vault.raw_value_for("TOKEN", "evil.com").unwrap_err();
        assert_eq!(err.kind_name(), "policy");
    }

    #[test]
    fn raw_value_for_no_allow_list_means_any_host() {
        let mut vault = SecretsVault::new(true);
        vault.bind("TOKEN", "sk-abc", None);
        let val = vault.raw_value_for("TOKEN", "anywhere.com").unwrap();
        assert_eq!(val.as_deref(), Some("sk-abc"));
    }

    #[test]
    fn scrub_table_empty_when_disabled() {
        let mut vault = SecretsVault::new(false);
        vault.bind("TOKEN", "sk-abc", None);
        assert!(vault.scrub_table().is_empty());
    }
}
