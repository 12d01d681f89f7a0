// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 16-byte identifiers for processes and nodes.
//!
//! Generation mixes a process-wide counter, the wall clock, and a hash
//! of the current thread id, so no external randomness source is
//! needed. Collisions across processes started in the same nanosecond
//! are broken by the thread-id hash.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SEED: AtomicU64 = AtomicU64::new(1);

/// 16-byte identifier with a total order.
///
/// Used both as the per-process UUID (generated once at runtime
/// construction) and as per-node UUIDs. The `Ord` impl backs the
/// deterministic service endpoint selection rule.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// The all-zero identifier, used as the "no node" marker in
    /// process-level disconnection events.
    pub const NIL: Uuid = Uuid([0u8; 16]);

    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        let seed = NEXT_SEED.fetch_add(1, Ordering::Relaxed);

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let tid_hash = {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            hasher.finish()
        };

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        seed.hash(&mut hasher);
        nanos.hash(&mut hasher);
        tid_hash.hash(&mut hasher);
        let hi = hasher.finish();
        hi.hash(&mut hasher);
        nanos.hash(&mut hasher);
        let lo = hasher.finish();

        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_le_bytes());
        bytes[8..].copy_from_slice(&lo.to_le_bytes());
        Uuid(bytes)
    }

    /// Build from raw wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(bytes)
    }

    /// Raw bytes for the wire.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// True for the all-zero marker.
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uuids_are_unique() {
        let a = Uuid::generate();
        let b = Uuid::generate();
        assert_ne!(a, b);
        assert!(!a.is_nil());
    }

    #[test]
    fn nil_is_nil() {
        assert!(Uuid::NIL.is_nil());
        assert!(Uuid::NIL < Uuid::from_bytes([0xff; 16]));
    }

    #[test]
    fn wire_round_trip() {
        let a = Uuid::generate();
        let b = Uuid::from_bytes(*a.as_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn display_is_hyphenated_hex() {
        let s = Uuid::from_bytes([0xab; 16]).to_string();
        assert_eq!(s, "abababab-abab-abab-abab-abababababab");
    }
}
