//! PostgreSQL-backed [`DatumBackend`] via `sqlx`.
//!
//! Every statement the backend runs comes from the [`Statement`] catalog
//! below, each declaring its parameter signature. Parameters are built as
//! [`QueryParams`] and checked against that signature before binding.
//! `sqlx` prepares and caches statements per connection, so dropping a
//! failed connection discards every cached statement with it.
//!
//! Column encoding:
//!
//! - `u32` fields are stored in `BIGINT`, which holds them exactly.
//! - `u64` fields (`expire`, `rvalue`) are stored in `BIGINT` with the sign
//!   bit flipped, which maps unsigned order onto signed order.
//! - Uids come from a `BIGSERIAL`, which never reissues a value even after
//!   every row is deleted.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnection, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Connection, Row};
use tracing::debug;
use veil_core::{AbsoluteTime, BlockType, Datum, HashCode, PendingDatum, Uid};

use crate::error::{BackendError, BackendResult};
use crate::storage::backend::{Connector, DatumBackend, Selection};
use crate::storage::params::ParamKind::{Blob, Hash, I32, I64, U32, U64};
use crate::storage::params::{ParamKind, QueryParam, QueryParams};

/// A SQL statement with its declared parameter signature.
#[derive(Debug)]
pub struct Statement {
    pub name: &'static str,
    pub sql: &'static str,
    pub params: &'static [ParamKind],
}

macro_rules! select_rows {
    ($tail:literal) => {
        concat!(
            "SELECT uid, repl, type, prio, anon_level, expire, rvalue, hash, vhash, value \
             FROM datastore ",
            $tail
        )
    };
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS datastore (\
       uid BIGSERIAL PRIMARY KEY, \
       repl BIGINT NOT NULL DEFAULT 0, \
       type BIGINT NOT NULL DEFAULT 0, \
       prio BIGINT NOT NULL DEFAULT 0, \
       anon_level BIGINT NOT NULL DEFAULT 0, \
       expire BIGINT NOT NULL, \
       rvalue BIGINT NOT NULL, \
       hash BYTEA NOT NULL, \
       vhash BYTEA NOT NULL, \
       value BYTEA NOT NULL)",
    "CREATE INDEX IF NOT EXISTS idx_hash ON datastore (hash)",
    "CREATE INDEX IF NOT EXISTS idx_hash_vhash ON datastore (hash, vhash)",
    "CREATE INDEX IF NOT EXISTS idx_hash_type ON datastore (hash, type)",
    "CREATE INDEX IF NOT EXISTS idx_anon_type_rvalue ON datastore (anon_level, type, rvalue)",
    "CREATE INDEX IF NOT EXISTS idx_repl_rvalue ON datastore (repl, rvalue)",
    "CREATE INDEX IF NOT EXISTS idx_expire ON datastore (expire)",
    "CREATE INDEX IF NOT EXISTS idx_prio ON datastore (prio)",
];

pub const INSERT: Statement = Statement {
    name: "insert",
    sql: "INSERT INTO datastore \
          (repl, type, prio, anon_level, expire, rvalue, hash, vhash, value) \
          VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING uid",
    params: &[U32, U32, U32, U32, U64, U64, Hash, Hash, Blob],
};

pub const UPDATE: Statement = Statement {
    name: "update",
    sql: "UPDATE datastore SET \
          prio = LEAST(GREATEST(prio + $1, 0), 4294967295), \
          expire = GREATEST(expire, $2) \
          WHERE uid = $3",
    params: &[I32, U64, I64],
};

pub const DECREMENT_REPLICATION: Statement = Statement {
    name: "decrement_replication",
    sql: "UPDATE datastore SET repl = GREATEST(repl - 1, 0) WHERE uid = $1",
    params: &[I64],
};

pub const DELETE: Statement = Statement {
    name: "delete",
    sql: "DELETE FROM datastore WHERE uid = $1 RETURNING octet_length(value)::BIGINT AS len",
    params: &[I64],
};

pub const COUNT_KEY: Statement = Statement {
    name: "count_key",
    sql: "SELECT count(*) AS n FROM datastore WHERE hash = $1",
    params: &[Hash],
};

pub const COUNT_KEY_VHASH: Statement = Statement {
    name: "count_key_vhash",
    sql: "SELECT count(*) AS n FROM datastore WHERE hash = $1 AND vhash = $2",
    params: &[Hash, Hash],
};

pub const COUNT_KEY_TYPE: Statement = Statement {
    name: "count_key_type",
    sql: "SELECT count(*) AS n FROM datastore WHERE hash = $1 AND type = $2",
    params: &[Hash, U32],
};

pub const COUNT_KEY_VHASH_TYPE: Statement = Statement {
    name: "count_key_vhash_type",
    sql: "SELECT count(*) AS n FROM datastore WHERE hash = $1 AND vhash = $2 AND type = $3",
    params: &[Hash, Hash, U32],
};

pub const NTH_KEY: Statement = Statement {
    name: "nth_key",
    sql: select_rows!("WHERE hash = $1 ORDER BY uid ASC LIMIT 1 OFFSET $2"),
    params: &[Hash, I64],
};

pub const NTH_KEY_VHASH: Statement = Statement {
    name: "nth_key_vhash",
    sql: select_rows!("WHERE hash = $1 AND vhash = $2 ORDER BY uid ASC LIMIT 1 OFFSET $3"),
    params: &[Hash, Hash, I64],
};

pub const NTH_KEY_TYPE: Statement = Statement {
    name: "nth_key_type",
    sql: select_rows!("WHERE hash = $1 AND type = $2 ORDER BY uid ASC LIMIT 1 OFFSET $3"),
    params: &[Hash, U32, I64],
};

pub const NTH_KEY_VHASH_TYPE: Statement = Statement {
    name: "nth_key_vhash_type",
    sql: select_rows!(
        "WHERE hash = $1 AND vhash = $2 AND type = $3 ORDER BY uid ASC LIMIT 1 OFFSET $4"
    ),
    params: &[Hash, Hash, U32, I64],
};

pub const COUNT_ZERO_ANONYMITY: Statement = Statement {
    name: "count_zero_anonymity",
    sql: "SELECT count(*) AS n FROM datastore WHERE anon_level = 0",
    params: &[],
};

pub const COUNT_ZERO_ANONYMITY_TYPE: Statement = Statement {
    name: "count_zero_anonymity_type",
    sql: "SELECT count(*) AS n FROM datastore WHERE anon_level = 0 AND type = $1",
    params: &[U32],
};

pub const NTH_ZERO_ANONYMITY: Statement = Statement {
    name: "nth_zero_anonymity",
    sql: select_rows!(
        "WHERE anon_level = 0 ORDER BY type ASC, rvalue ASC, uid ASC LIMIT 1 OFFSET $1"
    ),
    params: &[I64],
};

pub const NTH_ZERO_ANONYMITY_TYPE: Statement = Statement {
    name: "nth_zero_anonymity_type",
    sql: select_rows!(
        "WHERE anon_level = 0 AND type = $1 ORDER BY rvalue ASC, uid ASC LIMIT 1 OFFSET $2"
    ),
    params: &[U32, I64],
};

pub const MAX_REPLICATION: Statement = Statement {
    name: "max_replication",
    sql: "SELECT MAX(repl) AS repl FROM datastore",
    params: &[],
};

pub const RING_SUCCESSOR: Statement = Statement {
    name: "ring_successor",
    sql: select_rows!("WHERE repl = $1 AND rvalue >= $2 ORDER BY rvalue ASC, uid ASC LIMIT 1"),
    params: &[U32, U64],
};

pub const SOONEST_EXPIRED: Statement = Statement {
    name: "soonest_expired",
    sql: select_rows!("WHERE expire < $1 ORDER BY expire ASC, uid ASC LIMIT 1"),
    params: &[U64],
};

pub const LOWEST_PRIORITY: Statement = Statement {
    name: "lowest_priority",
    sql: select_rows!("ORDER BY prio ASC, uid ASC LIMIT 1"),
    params: &[],
};

pub const PAYLOAD: Statement = Statement {
    name: "payload",
    sql: "SELECT COALESCE(SUM(octet_length(value)), 0)::BIGINT AS bytes FROM datastore",
    params: &[],
};

pub const KEYS: Statement = Statement {
    name: "keys",
    sql: "SELECT hash FROM datastore ORDER BY uid ASC",
    params: &[],
};

pub const DROP_ALL: Statement = Statement {
    name: "drop_all",
    sql: "WITH d AS (DELETE FROM datastore RETURNING octet_length(value) AS len) \
          SELECT COALESCE(SUM(len), 0)::BIGINT AS freed FROM d",
    params: &[],
};

/// Every statement the backend issues.
pub const CATALOG: &[&Statement] = &[
    &INSERT,
    &UPDATE,
    &DECREMENT_REPLICATION,
    &DELETE,
    &COUNT_KEY,
    &COUNT_KEY_VHASH,
    &COUNT_KEY_TYPE,
    &COUNT_KEY_VHASH_TYPE,
    &NTH_KEY,
    &NTH_KEY_VHASH,
    &NTH_KEY_TYPE,
    &NTH_KEY_VHASH_TYPE,
    &COUNT_ZERO_ANONYMITY,
    &COUNT_ZERO_ANONYMITY_TYPE,
    &NTH_ZERO_ANONYMITY,
    &NTH_ZERO_ANONYMITY_TYPE,
    &MAX_REPLICATION,
    &RING_SUCCESSOR,
    &SOONEST_EXPIRED,
    &LOWEST_PRIORITY,
    &PAYLOAD,
    &KEYS,
    &DROP_ALL,
];

/// Maps an unsigned value onto `BIGINT` preserving order.
#[allow(clippy::cast_possible_wrap)]
fn to_ordered(value: u64) -> i64 {
    (value ^ (1 << 63)) as i64
}

#[allow(clippy::cast_sign_loss)]
fn from_ordered(value: i64) -> u64 {
    (value as u64) ^ (1 << 63)
}

fn sql_uid(uid: Uid) -> BackendResult<i64> {
    i64::try_from(uid.0).map_err(|_| BackendError::Database(format!("uid {uid} out of range")))
}

fn narrow(column: &str, value: i64) -> BackendResult<u32> {
    u32::try_from(value)
        .map_err(|_| BackendError::Corrupt(format!("{column} value {value} out of range")))
}

fn hash_column(row: &PgRow, column: &str) -> BackendResult<HashCode> {
    let bytes: Vec<u8> = row.try_get(column)?;
    HashCode::try_from_slice(&bytes).map_err(|e| BackendError::Corrupt(format!("{column}: {e}")))
}

fn decode_row(row: &PgRow) -> BackendResult<Datum> {
    let uid: i64 = row.try_get("uid")?;
    Ok(Datum {
        uid: Uid(u64::try_from(uid).map_err(|_| BackendError::Corrupt(format!("uid {uid}")))?),
        key: hash_column(row, "hash")?,
        vhash: hash_column(row, "vhash")?,
        block_type: BlockType(narrow("type", row.try_get("type")?)?),
        priority: narrow("prio", row.try_get("prio")?)?,
        anonymity: narrow("anon_level", row.try_get("anon_level")?)?,
        replication: narrow("repl", row.try_get("repl")?)?,
        expiration: AbsoluteTime::from_micros(from_ordered(row.try_get("expire")?)),
        rvalue: from_ordered(row.try_get("rvalue")?),
        value: row.try_get("value")?,
    })
}

/// Checks `params` against `statement` and binds them in order.
///
/// # Errors
///
/// Returns [`BackendError::Param`] if the parameters do not match the
/// statement's signature.
pub fn bind(
    statement: &'static Statement,
    params: QueryParams,
) -> BackendResult<Query<'static, Postgres, PgArguments>> {
    params.check(statement.name, statement.params)?;
    let mut query = sqlx::query(statement.sql);
    for param in params {
        query = match param {
            QueryParam::Hash(hash) => query.bind(hash.as_bytes().to_vec()),
            QueryParam::Blob(bytes) => query.bind(bytes),
            QueryParam::U32(value) => query.bind(i64::from(value)),
            QueryParam::U64(value) => query.bind(to_ordered(value)),
            QueryParam::I32(value) => query.bind(value),
            QueryParam::I64(value) => query.bind(value),
        };
    }
    Ok(query)
}

/// The count statement, positional statement, and shared filter parameters
/// for a selection.
fn selection_statements(
    selection: &Selection,
) -> (&'static Statement, &'static Statement, QueryParams) {
    match selection {
        Selection::Key(query) => {
            let params = QueryParams::new().hash(query.key);
            match (query.vhash, query.block_type.is_any()) {
                (None, true) => (&COUNT_KEY, &NTH_KEY, params),
                (Some(vhash), true) => (&COUNT_KEY_VHASH, &NTH_KEY_VHASH, params.hash(vhash)),
                (None, false) => (
                    &COUNT_KEY_TYPE,
                    &NTH_KEY_TYPE,
                    params.u32(query.block_type.0),
                ),
                (Some(vhash), false) => (
                    &COUNT_KEY_VHASH_TYPE,
                    &NTH_KEY_VHASH_TYPE,
                    params.hash(vhash).u32(query.block_type.0),
                ),
            }
        }
        Selection::ZeroAnonymity(block_type) if block_type.is_any() => (
            &COUNT_ZERO_ANONYMITY,
            &NTH_ZERO_ANONYMITY,
            QueryParams::new(),
        ),
        Selection::ZeroAnonymity(block_type) => (
            &COUNT_ZERO_ANONYMITY_TYPE,
            &NTH_ZERO_ANONYMITY_TYPE,
            QueryParams::new().u32(block_type.0),
        ),
    }
}

/// Opens [`PostgresBackend`] connections to one database.
pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self) -> BackendResult<Box<dyn DatumBackend>> {
        let mut conn = PgConnection::connect(&self.url)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&mut conn).await?;
        }
        debug!(target = %self.describe(), "postgres schema ready");
        Ok(Box::new(PostgresBackend { conn }))
    }

    fn describe(&self) -> String {
        let location = self.url.rsplit('@').next().unwrap_or_default();
        let location = location.trim_start_matches("postgres://").trim_start_matches("postgresql://");
        format!("postgres:{location}")
    }
}

/// One connection to the datastore table.
pub struct PostgresBackend {
    conn: PgConnection,
}

impl PostgresBackend {
    async fn optional_datum(
        &mut self,
        statement: &'static Statement,
        params: QueryParams,
    ) -> BackendResult<Option<Datum>> {
        let row = bind(statement, params)?
            .fetch_optional(&mut self.conn)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn scalar(
        &mut self,
        statement: &'static Statement,
        params: QueryParams,
        column: &str,
    ) -> BackendResult<i64> {
        let row = bind(statement, params)?.fetch_one(&mut self.conn).await?;
        Ok(row.try_get(column)?)
    }
}

#[async_trait]
impl DatumBackend for PostgresBackend {
    async fn insert(&mut self, datum: &PendingDatum) -> BackendResult<Uid> {
        let params = QueryParams::new()
            .u32(datum.replication)
            .u32(datum.block_type.0)
            .u32(datum.priority)
            .u32(datum.anonymity)
            .u64(datum.expiration.as_micros())
            .u64(datum.rvalue)
            .hash(datum.key)
            .hash(datum.vhash)
            .blob(datum.value.clone());
        let uid = self.scalar(&INSERT, params, "uid").await?;
        u64::try_from(uid)
            .map(Uid)
            .map_err(|_| BackendError::Corrupt(format!("uid {uid}")))
    }

    async fn update(
        &mut self,
        uid: Uid,
        priority_delta: i32,
        expiration: AbsoluteTime,
    ) -> BackendResult<bool> {
        let params = QueryParams::new()
            .i32(priority_delta)
            .u64(expiration.as_micros())
            .i64(sql_uid(uid)?);
        let result = bind(&UPDATE, params)?.execute(&mut self.conn).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn decrement_replication(&mut self, uid: Uid) -> BackendResult<bool> {
        let params = QueryParams::new().i64(sql_uid(uid)?);
        let result = bind(&DECREMENT_REPLICATION, params)?
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&mut self, uid: Uid) -> BackendResult<Option<u64>> {
        let params = QueryParams::new().i64(sql_uid(uid)?);
        let row = bind(&DELETE, params)?
            .fetch_optional(&mut self.conn)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let len: i64 = row.try_get("len")?;
        Ok(Some(u64::try_from(len).unwrap_or(0)))
    }

    async fn count(&mut self, selection: &Selection) -> BackendResult<u64> {
        let (count, _, params) = selection_statements(selection);
        let n = self.scalar(count, params, "n").await?;
        Ok(u64::try_from(n).unwrap_or(0))
    }

    async fn nth(&mut self, selection: &Selection, index: u64) -> BackendResult<Option<Datum>> {
        let (_, nth, params) = selection_statements(selection);
        let Ok(offset) = i64::try_from(index) else {
            return Ok(None);
        };
        self.optional_datum(nth, params.i64(offset)).await
    }

    async fn max_replication(&mut self) -> BackendResult<Option<u32>> {
        let row = bind(&MAX_REPLICATION, QueryParams::new())?
            .fetch_one(&mut self.conn)
            .await?;
        let max: Option<i64> = row.try_get("repl")?;
        max.map(|value| narrow("repl", value)).transpose()
    }

    async fn ring_successor(
        &mut self,
        replication: u32,
        from: u64,
    ) -> BackendResult<Option<Datum>> {
        let params = QueryParams::new().u32(replication).u64(from);
        self.optional_datum(&RING_SUCCESSOR, params).await
    }

    async fn soonest_expired(&mut self, before: AbsoluteTime) -> BackendResult<Option<Datum>> {
        let params = QueryParams::new().u64(before.as_micros());
        self.optional_datum(&SOONEST_EXPIRED, params).await
    }

    async fn lowest_priority(&mut self) -> BackendResult<Option<Datum>> {
        self.optional_datum(&LOWEST_PRIORITY, QueryParams::new())
            .await
    }

    async fn payload(&mut self) -> BackendResult<u64> {
        let bytes = self.scalar(&PAYLOAD, QueryParams::new(), "bytes").await?;
        Ok(u64::try_from(bytes).unwrap_or(0))
    }

    async fn keys(&mut self) -> BackendResult<Vec<HashCode>> {
        let rows = bind(&KEYS, QueryParams::new())?
            .fetch_all(&mut self.conn)
            .await?;
        rows.iter().map(|row| hash_column(row, "hash")).collect()
    }

    async fn drop_all(&mut self) -> BackendResult<u64> {
        let freed = self.scalar(&DROP_ALL, QueryParams::new(), "freed").await?;
        Ok(u64::try_from(freed).unwrap_or(0))
    }
}
