//! Datum records: the unit of storage in the datastore.
//!
//! A datum moves through three shapes:
//!
//! - [`NewDatum`]: what a caller hands to `put`, validated before anything
//!   touches storage.
//! - [`PendingDatum`]: a validated datum with its value hash and random sort
//!   key drawn, ready for a backend to insert.
//! - [`Datum`]: a stored row, carrying the backend-assigned [`Uid`].

use serde::{Deserialize, Serialize};

use crate::hash::HashCode;
use crate::time::AbsoluteTime;
use crate::types::{BlockType, Uid};

/// Largest value a single datum may carry, in bytes.
pub const MAX_DATUM_SIZE: usize = 64 * 1024;

/// Reasons a [`NewDatum`] is refused before any storage is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The value exceeds [`MAX_DATUM_SIZE`].
    #[error("value of {size} bytes exceeds the {max} byte datum limit")]
    TooLarge {
        /// Offending value length.
        size: usize,
        /// The limit that was exceeded.
        max: usize,
    },
    /// The wildcard type cannot be stored.
    #[error("block type 0 is a query wildcard and cannot be stored")]
    WildcardType,
}

/// A datum as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDatum {
    /// Content hash the block is published under.
    pub key: HashCode,
    /// Opaque payload.
    pub value: Vec<u8>,
    /// Content type tag.
    pub block_type: BlockType,
    /// Retention weight; higher survives eviction longer.
    pub priority: u32,
    /// 0 means the content may be exposed without anonymization.
    pub anonymity: u32,
    /// Remaining push replications owed to the network.
    pub replication: u32,
    /// Time after which the datum may be evicted regardless of priority.
    pub expiration: AbsoluteTime,
}

impl NewDatum {
    /// Checks the size and type constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::TooLarge`] for oversized values and
    /// [`ValidationError::WildcardType`] for type 0.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.value.len() > MAX_DATUM_SIZE {
            return Err(ValidationError::TooLarge {
                size: self.value.len(),
                max: MAX_DATUM_SIZE,
            });
        }
        if self.block_type.is_any() {
            return Err(ValidationError::WildcardType);
        }
        Ok(())
    }

    /// Validates, hashes the value, and attaches the random sort key.
    ///
    /// # Errors
    ///
    /// Propagates [`NewDatum::validate`] failures.
    pub fn prepare(self, rvalue: u64) -> Result<PendingDatum, ValidationError> {
        self.validate()?;
        Ok(PendingDatum {
            vhash: HashCode::digest(&self.value),
            key: self.key,
            block_type: self.block_type,
            priority: self.priority,
            anonymity: self.anonymity,
            replication: self.replication,
            expiration: self.expiration,
            rvalue,
            value: self.value,
        })
    }
}

/// A validated datum awaiting a backend-assigned [`Uid`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDatum {
    pub key: HashCode,
    pub vhash: HashCode,
    pub block_type: BlockType,
    pub priority: u32,
    pub anonymity: u32,
    pub replication: u32,
    pub expiration: AbsoluteTime,
    pub rvalue: u64,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl PendingDatum {
    /// Attaches the identifier the backend assigned on insert.
    #[must_use]
    pub fn with_uid(self, uid: Uid) -> Datum {
        Datum {
            uid,
            key: self.key,
            vhash: self.vhash,
            block_type: self.block_type,
            priority: self.priority,
            anonymity: self.anonymity,
            replication: self.replication,
            expiration: self.expiration,
            rvalue: self.rvalue,
            value: self.value,
        }
    }
}

/// A stored datum.
///
/// `key`, `vhash`, `block_type`, `rvalue`, and `value` never change after
/// insert. `priority` and `expiration` change only through `update`, and
/// `replication` only through replication selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    pub uid: Uid,
    pub key: HashCode,
    pub vhash: HashCode,
    pub block_type: BlockType,
    pub priority: u32,
    pub anonymity: u32,
    pub replication: u32,
    pub expiration: AbsoluteTime,
    pub rvalue: u64,
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
}

impl Datum {
    /// Payload length in bytes, as counted by quota accounting.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.value.len() as u64
    }

    /// Whether the datum has expired as of `now`.
    #[must_use]
    pub fn is_expired(&self, now: AbsoluteTime) -> bool {
        self.expiration.is_before(now)
    }
}

/// Applies an `update` to a priority: `priority + delta`, clamped to `u32`.
///
/// A sum below zero becomes 0; a sum above `u32::MAX` saturates.
///
/// # Examples
///
/// ```
/// use veil_core::datum::merge_priority;
///
/// assert_eq!(merge_priority(5, 3), 8);
/// assert_eq!(merge_priority(5, -100), 0);
/// assert_eq!(merge_priority(u32::MAX, 1), u32::MAX);
/// ```
#[must_use]
pub fn merge_priority(priority: u32, delta: i32) -> u32 {
    let merged = i64::from(priority) + i64::from(delta);
    u32::try_from(merged.max(0)).unwrap_or(u32::MAX)
}

/// Applies an `update` to an expiration: the later of the two wins.
#[must_use]
pub fn merge_expiration(current: AbsoluteTime, proposed: AbsoluteTime) -> AbsoluteTime {
    current.max(proposed)
}

/// Decrements a replication counter, flooring at zero.
#[must_use]
pub const fn decrement_replication(replication: u32) -> u32 {
    replication.saturating_sub(1)
}
