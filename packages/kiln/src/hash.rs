//! Content hashing primitives.
//!
//! All strong hashing in `kiln` goes through [`ContentHash`], a thin wrapper
//! around a 256-bit blake3 digest. Fingerprints additionally need a fast
//! 64-bit hash suitable for in-memory maps and journal keys; that's
//! [`hash_u64`], which is deliberately a *different* algorithm
//! (`rustc-stable-hash`) chosen for speed rather than cryptographic strength.

use std::hash::{Hash, Hasher};

use derive_more::{Debug, Display};
use rustc_stable_hash::StableSipHasher128;
use serde::{Deserialize, Serialize};

/// A strong, content-addressable hash of file or command contents.
///
/// Hex-encoded for display and for on-disk JSON/text representations;
/// stored as raw bytes everywhere else.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Display, Debug, Serialize, Deserialize)]
#[display("{}", hex::encode(_0))]
#[debug("ContentHash({})", hex::encode(_0))]
pub struct ContentHash(#[serde(with = "serde_bytes_array")] [u8; 32]);

impl ContentHash {
    /// Hash a single buffer.
    pub fn from_buffer(buf: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(buf.as_ref()).as_bytes())
    }

    /// Wrap an already-computed blake3 digest without rehashing it.
    pub fn from_digest(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fold the hashes of many fields into a single digest, in the order
    /// given. Used to build `implicitDepsHash` from a sorted closure of file
    /// hashes, and to build a command fingerprint from its component fields.
    pub fn from_fields<'a>(fields: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(field);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// The raw bytes of the digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Truncate to the low 64 bits, for use as a compact journal/map key.
    /// Not a substitute for the full digest in the fingerprint itself.
    pub fn low_u64(&self) -> u64 {
        u64::from_le_bytes(self.0[..8].try_into().expect("8 bytes"))
    }
}

/// Hash an arbitrary [`Hash`]-able value down to a stable 64-bit digest.
///
/// Uses `rustc-stable-hash` rather than `std`'s `SipHasher` or `DefaultHasher`
/// because those are explicitly *not* stable across Rust versions or
/// processes; a fingerprint that changed every time the compiler was upgraded
/// would defeat the entire point of caching it.
pub fn hash_u64<H: Hash>(hashable: H) -> u64 {
    let mut hasher = StableSipHasher128::new();
    hashable.hash(&mut hasher);
    hasher.finish()
}

mod serde_bytes_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        hex::encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_same_hash() {
        let a = ContentHash::from_buffer(b"hello world");
        let b = ContentHash::from_buffer(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_content_different_hash() {
        let a = ContentHash::from_buffer(b"hello world");
        let b = ContentHash::from_buffer(b"hello there");
        assert_ne!(a, b);
    }

    #[test]
    fn field_order_matters() {
        let a = ContentHash::from_fields([b"a".as_slice(), b"b".as_slice()]);
        let b = ContentHash::from_fields([b"b".as_slice(), b"a".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn hash_u64_is_deterministic() {
        assert_eq!(hash_u64("some/path"), hash_u64("some/path"));
        assert_ne!(hash_u64("some/path"), hash_u64("other/path"));
    }
}
