//! Typed statement parameters.
//!
//! Statements declare their parameter signature as a slice of [`ParamKind`].
//! Callers assemble a [`QueryParams`] with the builder methods, and the
//! backend calls [`QueryParams::check`] before binding, so a parameter list
//! that disagrees with its statement in count, order, or type is refused
//! instead of silently binding the wrong column.

use std::fmt;

use veil_core::HashCode;

/// Type tag of a single statement parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Fixed-size content hash.
    Hash,
    /// Variable-length binary.
    Blob,
    U32,
    /// Unsigned 64-bit value whose ordering must survive storage.
    U64,
    I32,
    I64,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hash => "hash",
            Self::Blob => "blob",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::I32 => "i32",
            Self::I64 => "i64",
        };
        f.write_str(name)
    }
}

/// A single bound value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryParam {
    Hash(HashCode),
    Blob(Vec<u8>),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
}

impl QueryParam {
    /// The type tag this value binds as.
    #[must_use]
    pub fn kind(&self) -> ParamKind {
        match self {
            Self::Hash(_) => ParamKind::Hash,
            Self::Blob(_) => ParamKind::Blob,
            Self::U32(_) => ParamKind::U32,
            Self::U64(_) => ParamKind::U64,
            Self::I32(_) => ParamKind::I32,
            Self::I64(_) => ParamKind::I64,
        }
    }
}

/// Mismatch between a parameter list and a statement signature.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("statement {statement} takes {expected} parameters, got {actual}")]
    Count {
        statement: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("statement {statement} parameter {position} must be {expected}, got {actual}")]
    Kind {
        statement: &'static str,
        position: usize,
        expected: ParamKind,
        actual: ParamKind,
    },
}

/// Ordered parameter list built with typed setters.
///
/// ```
/// use veil_core::HashCode;
/// use veil_datastore::storage::params::{ParamKind, QueryParams};
///
/// let params = QueryParams::new().hash(HashCode::digest(b"k")).u32(3);
/// assert!(params.check("lookup", &[ParamKind::Hash, ParamKind::U32]).is_ok());
/// assert!(params.check("lookup", &[ParamKind::U32, ParamKind::Hash]).is_err());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: Vec<QueryParam>,
}

impl QueryParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn hash(mut self, value: HashCode) -> Self {
        self.params.push(QueryParam::Hash(value));
        self
    }

    #[must_use]
    pub fn blob(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.params.push(QueryParam::Blob(value.into()));
        self
    }

    #[must_use]
    pub fn u32(mut self, value: u32) -> Self {
        self.params.push(QueryParam::U32(value));
        self
    }

    #[must_use]
    pub fn u64(mut self, value: u64) -> Self {
        self.params.push(QueryParam::U64(value));
        self
    }

    #[must_use]
    pub fn i32(mut self, value: i32) -> Self {
        self.params.push(QueryParam::I32(value));
        self
    }

    #[must_use]
    pub fn i64(mut self, value: i64) -> Self {
        self.params.push(QueryParam::I64(value));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.params.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryParam> {
        self.params.iter()
    }

    /// Verifies the list against `signature`, position by position.
    ///
    /// # Errors
    ///
    /// Returns [`ParamError::Count`] on a length mismatch and
    /// [`ParamError::Kind`] for the first position whose type differs.
    pub fn check(&self, statement: &'static str, signature: &[ParamKind]) -> Result<(), ParamError> {
        if self.params.len() != signature.len() {
            return Err(ParamError::Count {
                statement,
                expected: signature.len(),
                actual: self.params.len(),
            });
        }
        for (position, (param, expected)) in self.params.iter().zip(signature).enumerate() {
            if param.kind() != *expected {
                return Err(ParamError::Kind {
                    statement,
                    position,
                    expected: *expected,
                    actual: param.kind(),
                });
            }
        }
        Ok(())
    }
}

impl IntoIterator for QueryParams {
    type Item = QueryParam;
    type IntoIter = std::vec::IntoIter<QueryParam>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_preserves_order() {
        let params = QueryParams::new().u32(1).i64(-2).blob(vec![9u8]);
        let kinds: Vec<ParamKind> = params.iter().map(QueryParam::kind).collect();
        assert_eq!(kinds, vec![ParamKind::U32, ParamKind::I64, ParamKind::Blob]);
    }

    #[test]
    fn count_mismatch_is_reported() {
        let err = QueryParams::new()
            .u64(1)
            .check("delete", &[ParamKind::U64, ParamKind::U32])
            .unwrap_err();
        assert_eq!(
            err,
            ParamError::Count {
                statement: "delete",
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn kind_mismatch_names_position() {
        let err = QueryParams::new()
            .u64(1)
            .u64(2)
            .check("update", &[ParamKind::U64, ParamKind::I32])
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "statement update parameter 1 must be i32, got u64"
        );
    }

    #[test]
    fn empty_list_matches_empty_signature() {
        assert!(QueryParams::new().check("drop", &[]).is_ok());
        assert!(QueryParams::new().is_empty());
    }
}
