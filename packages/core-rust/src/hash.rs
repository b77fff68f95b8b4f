//! Content hashes used as datum keys and value digests.
//!
//! A [`HashCode`] is a 512-bit SHA-512 digest. Blocks are addressed by the
//! hash their publisher computed (the `key`), and every stored value is also
//! digested locally (the `vhash`) so that datums sharing a key can be told
//! apart without comparing payloads.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

/// Length of a [`HashCode`] in bytes.
pub const HASH_SIZE: usize = 64;

/// A 512-bit content hash.
///
/// Ordering is lexicographic over the raw bytes, which is also the order the
/// persistent backends use in their key indices.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashCode([u8; HASH_SIZE]);

impl HashCode {
    /// The all-zero hash.
    pub const ZERO: Self = Self([0u8; HASH_SIZE]);

    /// Wraps raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hashes `data` with SHA-512.
    ///
    /// # Examples
    ///
    /// ```
    /// use veil_core::hash::HashCode;
    ///
    /// let a = HashCode::digest(b"block");
    /// assert_eq!(a, HashCode::digest(b"block"));
    /// assert_ne!(a, HashCode::digest(b"other"));
    /// ```
    #[must_use]
    pub fn digest(data: &[u8]) -> Self {
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&Sha512::digest(data));
        Self(bytes)
    }

    /// Borrows the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Parses a hash from a byte slice of exactly [`HASH_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HashParseError::Length`] if the slice has the wrong length.
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, HashParseError> {
        let array: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| HashParseError::Length(bytes.len()))?;
        Ok(Self(array))
    }

    /// Short hex prefix for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for HashCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashCode({}..)", self.short())
    }
}

/// Error parsing a [`HashCode`] from bytes or hex.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashParseError {
    /// Input decoded to the wrong number of bytes.
    #[error("expected 64 hash bytes, got {0}")]
    Length(usize),
    /// Input was not valid hex.
    #[error("invalid hex: {0}")]
    Hex(String),
}

impl FromStr for HashCode {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| HashParseError::Hex(e.to_string()))?;
        Self::try_from_slice(&bytes)
    }
}

// serde only derives arrays up to 32 elements, so hashes travel as byte strings.
impl Serialize for HashCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for HashCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Self::try_from_slice(&buf).map_err(D::Error::custom)
    }
}
