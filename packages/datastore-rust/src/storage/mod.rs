//! Storage layer for the datastore.
//!
//! - [`DatumBackend`]: primitive, per-call-atomic operations on persisted
//!   datums, realized by each backend in [`backends`].
//! - [`Connector`]: opens backend connections.
//! - [`Session`]: owns one connection and recovers from backend failures by
//!   reconnecting.
//! - [`params`]: typed statement parameters for SQL backends.

pub mod backend;
pub mod backends;
pub mod params;
pub mod session;

pub use backend::*;
pub use session::{RetryPolicy, Session};
