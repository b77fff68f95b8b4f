//! Concrete [`DatumBackend`](super::backend::DatumBackend) implementations.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redb")]
pub mod redb;

pub use memory::{MemoryBackend, MemoryConnector};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresBackend, PostgresConnector};
#[cfg(feature = "redb")]
pub use redb::{RedbBackend, RedbConnector};
