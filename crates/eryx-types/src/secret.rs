//! Secret values and the placeholder tokens handed to the guest in
//! their place.

use zeroize::Zeroizing;

/// A secret bound into a sandbox/session.
///
/// The raw `value` never reaches guest-visible memory; the guest only
/// ever sees `placeholder`. `zeroize` wipes the value on drop, mirroring
/// how credential material is held elsewhere in this stack.
pub struct Secret {
    /// Symbolic name the guest uses to look the secret up (e.g. an env var name).
    pub name: String,
    /// Raw secret value, zeroized on drop.
    pub value: Zeroizing<String>,
    /// Opaque token the guest sees in place of `value`.
    pub placeholder: String,
    /// If set, only these hosts may receive the raw value (checked by
    /// the vault before rewriting a placeholder back for an outbound
    /// network call).
    pub allow_hosts: Option<Vec<String>>,
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("placeholder", &self.placeholder)
            .field("allow_hosts", &self.allow_hosts)
            .finish()
    }
}

/// Minimum number of random bytes backing a placeholder token, per the
/// spec's "16+ random bytes, hex-encoded, framed" invariant.
pub const PLACEHOLDER_ENTROPY_BYTES: usize = 16;

/// Prefix framing a placeholder so it can never collide with a
/// guest-reasonable literal string.
pub const PLACEHOLDER_PREFIX: &str = "eryx_secret_";

/// Generate a fresh, unique placeholder token.
///
/// Two calls never produce the same token (the entropy source is the
/// OS RNG via `rand`), so every distinct bind yields a distinct
/// placeholder even for the same secret name rebound later.
pub fn generate_placeholder() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; PLACEHOLDER_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{PLACEHOLDER_PREFIX}{}", hex::encode(bytes))
}
