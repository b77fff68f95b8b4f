//! Storage backend traits.
//!
//! [`DatumBackend`] is the primitive, per-operation-atomic interface every
//! backend realizes. It knows nothing about offsets, random rotation, or
//! verdicts: the selection policies in [`crate::select`] and the
//! [`Datastore`](crate::Datastore) facade compose these primitives.
//!
//! [`Connector`] opens backend connections. The
//! [`Session`](super::session::Session) owns one connection at a time and
//! replaces it through the connector after a failure.

use async_trait::async_trait;
use veil_core::{AbsoluteTime, BlockType, Datum, HashCode, PendingDatum, Uid};

use crate::error::BackendResult;

/// Filter for a keyed lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyQuery {
    pub key: HashCode,
    /// Restricts matches to datums whose value hashes to this.
    pub vhash: Option<HashCode>,
    /// [`BlockType::ANY`] matches every type.
    pub block_type: BlockType,
}

impl KeyQuery {
    /// Matches every datum stored under `key`.
    #[must_use]
    pub fn any(key: HashCode) -> Self {
        Self {
            key,
            vhash: None,
            block_type: BlockType::ANY,
        }
    }

    #[must_use]
    pub fn with_vhash(mut self, vhash: HashCode) -> Self {
        self.vhash = Some(vhash);
        self
    }

    #[must_use]
    pub fn with_type(mut self, block_type: BlockType) -> Self {
        self.block_type = block_type;
        self
    }

    /// Whether `datum` satisfies the filter.
    #[must_use]
    pub fn matches(&self, datum: &Datum) -> bool {
        datum.key == self.key
            && self.vhash.is_none_or(|v| v == datum.vhash)
            && self.block_type.matches(datum.block_type)
    }
}

/// A filtered, ordered subset of the store that supports counting and
/// positional access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Datums matching a [`KeyQuery`], ordered by uid ascending.
    Key(KeyQuery),
    /// Datums with anonymity 0 whose type matches, ordered by
    /// `(type, rvalue, uid)` ascending.
    ZeroAnonymity(BlockType),
}

impl Selection {
    /// Whether `datum` belongs to this selection.
    #[must_use]
    pub fn matches(&self, datum: &Datum) -> bool {
        match self {
            Self::Key(query) => query.matches(datum),
            Self::ZeroAnonymity(block_type) => {
                datum.anonymity == 0 && block_type.matches(datum.block_type)
            }
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Key(_) => "key",
            Self::ZeroAnonymity(_) => "zero_anonymity",
        }
    }
}

/// A connection to persisted datum storage.
///
/// Every method is atomic on its own: it either applies completely or leaves
/// storage untouched. Methods take `&mut self`, so one connection serves one
/// call at a time.
///
/// Used as `Box<dyn DatumBackend>`.
#[async_trait]
pub trait DatumBackend: Send {
    /// Stores a new datum and returns its freshly assigned uid.
    ///
    /// Uids are strictly increasing and never reused, even across
    /// [`drop_all`](DatumBackend::drop_all).
    async fn insert(&mut self, datum: &PendingDatum) -> BackendResult<Uid>;

    /// Adds `priority_delta` to the priority (clamped to `0..=u32::MAX`) and
    /// raises the expiration to `expiration` if that is later.
    ///
    /// Returns `false` if no datum has this uid.
    async fn update(
        &mut self,
        uid: Uid,
        priority_delta: i32,
        expiration: AbsoluteTime,
    ) -> BackendResult<bool>;

    /// Decrements the replication counter, flooring at zero.
    ///
    /// Returns `false` if no datum has this uid.
    async fn decrement_replication(&mut self, uid: Uid) -> BackendResult<bool>;

    /// Deletes a datum, returning its value length if it existed.
    async fn delete(&mut self, uid: Uid) -> BackendResult<Option<u64>>;

    /// Number of datums in `selection`.
    async fn count(&mut self, selection: &Selection) -> BackendResult<u64>;

    /// The datum at zero-based position `index` in `selection`'s order.
    async fn nth(&mut self, selection: &Selection, index: u64) -> BackendResult<Option<Datum>>;

    /// Highest replication counter in the store, or `None` when empty.
    async fn max_replication(&mut self) -> BackendResult<Option<u32>>;

    /// Among datums with exactly `replication`, the one with the smallest
    /// `rvalue >= from`, ties broken by uid.
    async fn ring_successor(&mut self, replication: u32, from: u64)
        -> BackendResult<Option<Datum>>;

    /// The datum with the smallest expiration strictly before `before`,
    /// ties broken by uid.
    async fn soonest_expired(&mut self, before: AbsoluteTime) -> BackendResult<Option<Datum>>;

    /// The datum with the smallest priority, ties broken by uid.
    async fn lowest_priority(&mut self) -> BackendResult<Option<Datum>>;

    /// Sum of value lengths across all datums.
    async fn payload(&mut self) -> BackendResult<u64>;

    /// Every stored key in uid order, duplicates included.
    async fn keys(&mut self) -> BackendResult<Vec<HashCode>>;

    /// Deletes every datum and returns the number of value bytes removed.
    async fn drop_all(&mut self) -> BackendResult<u64>;
}

/// Opens connections to one configured backend.
///
/// Used as `Arc<dyn Connector>` or `Box<dyn Connector>`.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a fresh connection.
    async fn connect(&self) -> BackendResult<Box<dyn DatumBackend>>;

    /// Human-readable target for logs, without credentials.
    fn describe(&self) -> String;
}
