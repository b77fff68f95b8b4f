//! Veil Core: content hashes, block types, timestamps, and datum records.

pub mod datum;
pub mod hash;
pub mod time;
pub mod types;

pub use datum::{Datum, NewDatum, PendingDatum, ValidationError, MAX_DATUM_SIZE};
pub use hash::{HashCode, HashParseError, HASH_SIZE};
pub use time::{AbsoluteTime, ClockSource, FixedClock, SystemClock};
pub use types::{BlockType, Uid};
