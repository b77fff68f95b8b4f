use std::fmt;

use serde::{Deserialize, Serialize};

/// Application-defined content type tag of a stored block.
///
/// `0` is reserved as the query wildcard ([`BlockType::ANY`]); stored
/// datums always carry a non-zero type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockType(pub u32);

impl BlockType {
    /// Wildcard: matches every type in queries.
    pub const ANY: Self = Self(0);
    /// File-sharing data block.
    pub const DBLOCK: Self = Self(1);
    /// File-sharing inner (index) block.
    pub const IBLOCK: Self = Self(2);
    /// Keyword block.
    pub const KBLOCK: Self = Self(3);
    /// Namespace block.
    pub const SBLOCK: Self = Self(4);
    /// Namespace advertisement block.
    pub const NBLOCK: Self = Self(5);
    /// Placeholder for content indexed on demand from a local file.
    pub const ONDEMAND: Self = Self(6);

    /// Whether this is the query wildcard.
    #[must_use]
    pub const fn is_any(self) -> bool {
        self.0 == 0
    }

    /// Whether a stored datum of type `stored` satisfies this filter.
    #[must_use]
    pub const fn matches(self, stored: Self) -> bool {
        self.is_any() || self.0 == stored.0
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend-assigned datum identifier.
///
/// Strictly increasing across inserts and never reused, even after the
/// store is dropped. Used as the handle for update and delete, and as the
/// deterministic tie-breaker in every selection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
