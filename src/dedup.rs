//! Packet fingerprinting and duplicate suppression.
//!
//! Packets are opaque, so identity is a content fingerprint: the first
//! 8 bytes of SHA-256. 64 bits keeps the collision probability negligible
//! at relay packet volumes (well under 1 in 10^12 per 10 000 packets).

use std::collections::HashSet;
use std::sync::Mutex;

use sha2::{Digest, Sha256};

/// Compact content fingerprint used for dedup and logging.
pub type PacketHash = [u8; 8];

/// First 8 bytes of SHA-256 over the packet bytes.
pub fn packet_hash(data: &[u8]) -> PacketHash {
    let digest = Sha256::digest(data);
    let mut hash = [0u8; 8];
    hash.copy_from_slice(&digest[..8]);
    hash
}

/// Bounded set of recently seen fingerprints. When the set reaches
/// `max_entries` it is cleared wholesale before the next insert; the brief
/// re-delivery window is acceptable because the application layer
/// deduplicates again above this one.
pub struct DedupFilter {
    seen: Mutex<HashSet<PacketHash>>,
    max_entries: usize,
}

impl DedupFilter {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            seen: Mutex::new(HashSet::with_capacity(max_entries)),
            max_entries,
        }
    }

    /// Atomic check-and-insert: true if `hash` was already recorded,
    /// otherwise records it and returns false.
    pub fn is_duplicate(&self, hash: PacketHash) -> bool {
        let mut seen = self.seen.lock().expect("dedup lock poisoned");

        if seen.contains(&hash) {
            return true;
        }
        if seen.len() >= self.max_entries {
            seen.clear();
        }
        seen.insert(hash);
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}
