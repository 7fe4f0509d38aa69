//! Snapshot Codec — size-bounded opaque session-state capture/restore
//! (spec §4.11).
//!
//! The codec never interprets the bytes the guest hands back from
//! `snapshot_state`; it only enforces the size ceiling and gives
//! `restore_state` failures a defined fallback (the session keeps its
//! pre-restore state).

use eryx_types::{EryxError, EryxResult};

/// Default ceiling on one snapshot blob (spec §3: "≤ 10 MiB").
pub const DEFAULT_MAX_SNAPSHOT_BYTES: usize = 10 * 1024 * 1024;

pub struct SnapshotCodec {
    max_bytes: usize,
}

impl Default for SnapshotCodec {
    fn default() -> Self {
        Self { max_bytes: DEFAULT_MAX_SNAPSHOT_BYTES }
    }
}

impl SnapshotCodec {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Validate a snapshot produced by `snapshot_state()` before handing
    /// it to the caller. The codec does not parse the bytes — it only
    /// checks the size ceiling.
    pub fn validate_outgoing(&self, bytes: &[u8]) -> EryxResult<()> {
        if bytes.len() > self.max_bytes {
            return Err(EryxError::Codec(format!(
                "snapshot of {} bytes exceeds the {}-byte ceiling",
                bytes.len(),
                self.max_bytes
            )));
        }
        Ok(())
    }

    /// Validate a snapshot before handing it to `restore_state()`. Same
    /// ceiling check applies on the way in — a caller-supplied blob
    /// that's too large is rejected before it ever reaches the guest.
    pub fn validate_incoming(&self, bytes: &[u8]) -> EryxResult<()> {
        if bytes.is_empty() {
            return Err(EryxError::Codec("snapshot is empty".into()));
        }
        if bytes.len() > self.max_bytes {
            return Err(EryxError::Codec(format!(
                "snapshot of {} bytes exceeds the {}-byte ceiling",
                bytes.len(),
                self.max_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_snapshot_rejected_both_directions() {
        let codec = SnapshotCodec::new(8);
        let blob = vec![0u8; 9];
        assert!(codec.validate_outgoing(&blob).is_err());
        assert!(codec.validate_incoming(&blob).is_err());
    }

    #[test]
    fn empty_incoming_snapshot_rejected() {
        let codec = SnapshotCodec::default();
        assert!(codec.validate_incoming(&[]).is_err());
    }

    #[test]
    fn snapshot_within_ceiling_accepted() {
        let codec = SnapshotCodec::new(1024);
        let blob = vec![1u8; 512];
        assert!(codec.validate_outgoing(&blob).is_ok());
        assert!(codec.validate_incoming(&blob).is_ok());
    }
}
