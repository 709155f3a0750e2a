//! Identifiers and deterministic hashing for feature sets and prediction inputs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn raw(&self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                $name(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identity of a model family.
    DefinitionId,
    "def"
);
numeric_id!(
    /// One trained (or training) artifact of a definition.
    VersionId,
    "ver"
);
numeric_id!(
    /// A submitted unit of training work.
    JobId,
    "job"
);
numeric_id!(
    /// A fitted, frozen feature transform configuration.
    FeatureSetId,
    "fs"
);
numeric_id!(
    /// One served prediction.
    PredictionId,
    "pred"
);

/// Monotonic id allocator. Ids start at 1.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Make sure ids handed out later never collide with `seen` (used after reloading state).
    pub fn observe(&self, seen: u64) {
        self.next.fetch_max(seen.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// 64-bit FNV-1a. Stable across processes and platforms, unlike `DefaultHasher`.
#[derive(Copy, Clone, Debug)]
pub struct StableHash(u64);

impl StableHash {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    pub fn new() -> Self {
        Self(Self::OFFSET_BASIS)
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 = (self.0 ^ u64::from(*b)).wrapping_mul(Self::PRIME);
        }
    }

    pub fn update_u64(&mut self, value: u64) {
        self.update(&value.to_le_bytes());
    }

    pub fn finish64(&self) -> u64 {
        self.0
    }

    /// 16-character lowercase hex, for logs and file names.
    pub fn finish_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn of(bytes: &[u8]) -> u64 {
        let mut h = Self::new();
        h.update(bytes);
        h.finish64()
    }
}

impl Default for StableHash {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable hash of a normalised prediction input; cache key and single-flight key.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_vectors() {
        assert_eq!(StableHash::of(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(StableHash::of(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(StableHash::of(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn generator_skips_observed_ids() {
        let ids = IdGenerator::new();
        assert_eq!(ids.next(), 1);
        ids.observe(41);
        assert_eq!(ids.next(), 42);
        ids.observe(3);
        assert_eq!(ids.next(), 43);
    }

    #[test]
    fn ids_display_with_prefix() {
        assert_eq!(DefinitionId(7).to_string(), "def-7");
        assert_eq!(JobId::from(3).to_string(), "job-3");
    }
}
