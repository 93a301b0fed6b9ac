//! Disk key derivation
//!
//! Request keys are arbitrary strings (usually URLs) and cannot be used as file
//! names directly. The disk tier stores each entry under a fixed-length hex
//! digest of the request key instead.

use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use tracing::warn;

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Digest used to turn a request key into a disk key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    /// 64-bit FNV-1a. Weak, but always available.
    Fnv1a,
}

impl HashAlgorithm {
    /// Look up a digest by name, `None` if it is not supported
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sha224" | "sha-224" => Some(Self::Sha224),
            "sha256" | "sha-256" => Some(Self::Sha256),
            "sha384" | "sha-384" => Some(Self::Sha384),
            "sha512" | "sha-512" => Some(Self::Sha512),
            "fnv" | "fnv1a" => Some(Self::Fnv1a),
            _ => None,
        }
    }
}

/// Derives filesystem-safe disk keys from request keys
#[derive(Debug, Clone, Copy)]
pub struct KeyHasher {
    algorithm: HashAlgorithm,
}

impl KeyHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Create a hasher for the named digest.
    ///
    /// An unknown name does not fail: the hasher degrades to FNV-1a, which
    /// only costs more collisions in the disk tier.
    pub fn from_name(name: &str) -> Self {
        match HashAlgorithm::from_name(name) {
            Some(algorithm) => Self::new(algorithm),
            None => {
                warn!(
                    algorithm = name,
                    "Hash algorithm unavailable, falling back to FNV-1a"
                );
                Self::new(HashAlgorithm::Fnv1a)
            }
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Hash a request key into a lowercase hex disk key
    pub fn hash(&self, key: &str) -> String {
        let bytes = key.as_bytes();
        match self.algorithm {
            HashAlgorithm::Sha224 => hex::encode(Sha224::digest(bytes)),
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha384 => hex::encode(Sha384::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
            HashAlgorithm::Fnv1a => format!("{:016x}", fnv1a(bytes)),
        }
    }
}

impl Default for KeyHasher {
    fn default() -> Self {
        Self::new(HashAlgorithm::Sha256)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_disk_key() {
        let hasher = KeyHasher::default();
        let key1 = hasher.hash("http://img.example.com/a.jpg");
        let key2 = hasher.hash("http://img.example.com/a.jpg");
        let key3 = hasher.hash("http://img.example.com/b.jpg");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1.len(), 64);
        assert!(key1.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_known_digest() {
        let hasher = KeyHasher::new(HashAlgorithm::Sha256);
        assert_eq!(
            hasher.hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(KeyHasher::new(HashAlgorithm::Sha224).hash("k").len(), 56);
        assert_eq!(KeyHasher::new(HashAlgorithm::Sha384).hash("k").len(), 96);
        assert_eq!(KeyHasher::new(HashAlgorithm::Sha512).hash("k").len(), 128);
        assert_eq!(KeyHasher::new(HashAlgorithm::Fnv1a).hash("k").len(), 16);
    }

    #[test]
    fn test_unknown_algorithm_falls_back() {
        let hasher = KeyHasher::from_name("md5");
        assert_eq!(hasher.algorithm(), HashAlgorithm::Fnv1a);

        let key = hasher.hash("img-1");
        assert_eq!(key, hasher.hash("img-1"));
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_from_name_is_case_insensitive() {
        assert_eq!(HashAlgorithm::from_name("SHA-512"), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::from_name(" sha256 "), Some(HashAlgorithm::Sha256));
    }
}
