//! Cache keys.
//!
//! A [`Key`] is the 256-bit fingerprint of an arbitrary input string.  Keys
//! are what strategies hand to the cache substrate; the substrate never
//! interprets the original string.

use std::fmt;

use sha2::{Digest, Sha256};

use super::CacheError;

/// A 32-byte cache key derived from a string via SHA-256.
///
/// Hex-encodes to 64 lowercase characters.  Equality is byte equality;
/// collisions are assumed not to occur below the cryptographic bound.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; 32]);

impl Key {
    /// Derive a key from an input string.
    pub fn new(input: &str) -> Self {
        let digest = Sha256::digest(input.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a key from its 64-character hex encoding.
    pub fn from_hex(s: &str) -> Result<Self, CacheError> {
        let raw = hex::decode(s).map_err(|_| CacheError::InvalidKey)?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| CacheError::InvalidKey)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_sha256_of_input() {
        let key = Key::new("hello");
        // sha256("hello")
        assert_eq!(
            key.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn hex_round_trip() {
        let key = Key::new("round-trip");
        let parsed = Key::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(Key::from_hex("not-hex").is_err());
        assert!(Key::from_hex("abcd").is_err());
    }

    #[test]
    fn distinct_inputs_distinct_keys() {
        assert_ne!(Key::new("a"), Key::new("b"));
        assert_eq!(Key::new("same"), Key::new("same"));
    }
}
