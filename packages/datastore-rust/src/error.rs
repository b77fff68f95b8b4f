//! Error types for the datastore.
//!
//! Two layers: [`BackendError`] stays inside the storage adapter and drives
//! the reconnect state machine, while [`DatastoreError`] is what facade
//! callers see. Every backend failure collapses into
//! [`DatastoreError::Storage`] at the facade boundary.

use veil_core::{Uid, ValidationError};

use crate::storage::params::ParamError;

/// Failures raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend could not be reached or refused the connection.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A statement or transaction failed during execution.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// Statement parameters did not match the statement's signature.
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(feature = "redb")]
mod redb_conversions {
    use super::BackendError;

    impl From<redb::DatabaseError> for BackendError {
        fn from(err: redb::DatabaseError) -> Self {
            BackendError::Unavailable(err.to_string())
        }
    }

    impl From<redb::TransactionError> for BackendError {
        fn from(err: redb::TransactionError) -> Self {
            BackendError::Database(err.to_string())
        }
    }

    impl From<redb::TableError> for BackendError {
        fn from(err: redb::TableError) -> Self {
            BackendError::Database(err.to_string())
        }
    }

    impl From<redb::StorageError> for BackendError {
        fn from(err: redb::StorageError) -> Self {
            BackendError::Database(err.to_string())
        }
    }

    impl From<redb::CommitError> for BackendError {
        fn from(err: redb::CommitError) -> Self {
            BackendError::Database(err.to_string())
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for BackendError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => BackendError::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                BackendError::Corrupt(err.to_string())
            }
            other => BackendError::Database(other.to_string()),
        }
    }
}

impl From<rmp_serde::decode::Error> for BackendError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        BackendError::Corrupt(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for BackendError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        BackendError::Database(err.to_string())
    }
}

/// Errors surfaced by the [`Datastore`](crate::Datastore) facade.
#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    /// The datum was refused before touching storage.
    #[error("invalid datum: {0}")]
    Validation(#[from] ValidationError),

    /// The backend failed and could not be recovered.
    #[error("storage failure: {0}")]
    Storage(#[from] BackendError),

    /// No datum with this uid exists.
    #[error("no datum with uid {0}")]
    UnknownUid(Uid),

    /// The datastore could not be assembled from its configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl DatastoreError {
    /// Whether the error reflects broken storage rather than a bad request.
    #[must_use]
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
