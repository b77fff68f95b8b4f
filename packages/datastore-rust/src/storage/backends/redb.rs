//! redb-backed [`DatumBackend`].
//!
//! Layout:
//!
//! - `rows`: uid → MessagePack-encoded [`Datum`].
//! - One index table per lookup order. Index keys are big-endian composite
//!   byte strings ending in the uid, so redb's bytewise key order is the
//!   selection order. Index values repeat the uid.
//! - `meta`: `last_uid` and `payload` counters.
//!
//! Every mutation runs in a single write transaction, so it commits whole or
//! not at all. Calls block the current task on file I/O.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use tracing::debug;
use veil_core::{datum, AbsoluteTime, Datum, HashCode, PendingDatum, Uid};

use crate::error::{BackendError, BackendResult};
use crate::storage::backend::{Connector, DatumBackend, Selection};

const ROWS: TableDefinition<u64, &[u8]> = TableDefinition::new("rows");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const LAST_UID: &str = "last_uid";
const PAYLOAD: &str = "payload";

type IndexTable = TableDefinition<'static, &'static [u8], u64>;

const KEY_INDEX: IndexTable = TableDefinition::new("idx_key");
const KEY_VHASH_INDEX: IndexTable = TableDefinition::new("idx_key_vhash");
const KEY_TYPE_INDEX: IndexTable = TableDefinition::new("idx_key_type");
const ANONYMITY_INDEX: IndexTable = TableDefinition::new("idx_anon_type_rvalue");
const REPLICATION_INDEX: IndexTable = TableDefinition::new("idx_repl_rvalue");
const EXPIRATION_INDEX: IndexTable = TableDefinition::new("idx_expire");
const PRIORITY_INDEX: IndexTable = TableDefinition::new("idx_prio");

/// An index table and the function deriving a row's entry in it.
struct Index {
    table: IndexTable,
    entry: fn(&Datum) -> Vec<u8>,
}

const INDICES: [Index; 7] = [
    Index {
        table: KEY_INDEX,
        entry: |d| Composite::new().hash(&d.key).u64(d.uid.0).finish(),
    },
    Index {
        table: KEY_VHASH_INDEX,
        entry: |d| {
            Composite::new()
                .hash(&d.key)
                .hash(&d.vhash)
                .u64(d.uid.0)
                .finish()
        },
    },
    Index {
        table: KEY_TYPE_INDEX,
        entry: |d| {
            Composite::new()
                .hash(&d.key)
                .u32(d.block_type.0)
                .u64(d.uid.0)
                .finish()
        },
    },
    Index {
        table: ANONYMITY_INDEX,
        entry: |d| {
            Composite::new()
                .u32(d.anonymity)
                .u32(d.block_type.0)
                .u64(d.rvalue)
                .u64(d.uid.0)
                .finish()
        },
    },
    Index {
        table: REPLICATION_INDEX,
        entry: |d| {
            Composite::new()
                .u32(d.replication)
                .u64(d.rvalue)
                .u64(d.uid.0)
                .finish()
        },
    },
    Index {
        table: EXPIRATION_INDEX,
        entry: |d| {
            Composite::new()
                .u64(d.expiration.as_micros())
                .u64(d.uid.0)
                .finish()
        },
    },
    Index {
        table: PRIORITY_INDEX,
        entry: |d| Composite::new().u32(d.priority).u64(d.uid.0).finish(),
    },
];

/// Builder for big-endian composite index keys.
struct Composite(Vec<u8>);

impl Composite {
    fn new() -> Self {
        Self(Vec::with_capacity(136))
    }

    fn hash(mut self, hash: &HashCode) -> Self {
        self.0.extend_from_slice(hash.as_bytes());
        self
    }

    fn u32(mut self, value: u32) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn u64(mut self, value: u64) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }

    /// Inclusive bounds covering every key that starts with this prefix and
    /// has `suffix` more bytes.
    fn span(self, suffix: usize) -> (Vec<u8>, Vec<u8>) {
        let low = self.0;
        let mut high = low.clone();
        high.resize(low.len() + suffix, 0xFF);
        (low, high)
    }
}

fn decode(bytes: &[u8]) -> BackendResult<Datum> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn encode(datum: &Datum) -> BackendResult<Vec<u8>> {
    Ok(rmp_serde::to_vec(datum)?)
}

fn read_u32(key: &[u8]) -> BackendResult<u32> {
    key.get(..4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or_else(|| BackendError::Corrupt(format!("index key of {} bytes", key.len())))
}

fn load(rows: &impl ReadableTable<u64, &'static [u8]>, uid: u64) -> BackendResult<Datum> {
    let guard = rows
        .get(uid)?
        .ok_or_else(|| BackendError::Corrupt(format!("index refers to missing row {uid}")))?;
    let datum = decode(guard.value())?;
    Ok(datum)
}

fn counter(meta: &impl ReadableTable<&'static str, u64>, name: &str) -> BackendResult<u64> {
    Ok(meta.get(name)?.map_or(0, |guard| guard.value()))
}

fn create_tables(txn: &WriteTransaction) -> BackendResult<()> {
    txn.open_table(ROWS)?;
    txn.open_table(META)?;
    for index in &INDICES {
        txn.open_table(index.table)?;
    }
    Ok(())
}

fn add_entries(txn: &WriteTransaction, datum: &Datum) -> BackendResult<()> {
    for index in &INDICES {
        let mut table = txn.open_table(index.table)?;
        table.insert((index.entry)(datum).as_slice(), datum.uid.0)?;
    }
    Ok(())
}

fn remove_entries(txn: &WriteTransaction, datum: &Datum) -> BackendResult<()> {
    for index in &INDICES {
        let mut table = txn.open_table(index.table)?;
        table.remove((index.entry)(datum).as_slice())?;
    }
    Ok(())
}

/// Reads the first row an index range points at.
fn first_in(
    txn: &ReadTransaction,
    index: IndexTable,
    low: &[u8],
    high: &[u8],
) -> BackendResult<Option<Datum>> {
    let table = txn.open_table(index)?;
    let mut range = table.range(low..=high)?;
    let Some(entry) = range.next() else {
        return Ok(None);
    };
    let uid = entry?.1.value();
    let rows = txn.open_table(ROWS)?;
    load(&rows, uid).map(Some)
}

/// Visits the uids of `selection` in order until `visit` returns `false`.
fn scan(
    txn: &ReadTransaction,
    selection: &Selection,
    mut visit: impl FnMut(u64) -> bool,
) -> BackendResult<()> {
    let mut type_filter = None;
    let (index, (low, high)) = match selection {
        Selection::Key(query) => match query.vhash {
            Some(vhash) => {
                if !query.block_type.is_any() {
                    type_filter = Some(query.block_type);
                }
                (
                    KEY_VHASH_INDEX,
                    Composite::new().hash(&query.key).hash(&vhash).span(8),
                )
            }
            None if !query.block_type.is_any() => (
                KEY_TYPE_INDEX,
                Composite::new()
                    .hash(&query.key)
                    .u32(query.block_type.0)
                    .span(8),
            ),
            None => (KEY_INDEX, Composite::new().hash(&query.key).span(8)),
        },
        Selection::ZeroAnonymity(block_type) if block_type.is_any() => {
            (ANONYMITY_INDEX, Composite::new().u32(0).span(20))
        }
        Selection::ZeroAnonymity(block_type) => (
            ANONYMITY_INDEX,
            Composite::new().u32(0).u32(block_type.0).span(16),
        ),
    };

    let table = txn.open_table(index)?;
    let rows = txn.open_table(ROWS)?;
    for entry in table.range(low.as_slice()..=high.as_slice())? {
        let (_, uid) = entry?;
        let uid = uid.value();
        if let Some(block_type) = type_filter {
            if !block_type.matches(load(&rows, uid)?.block_type) {
                continue;
            }
        }
        if !visit(uid) {
            break;
        }
    }
    Ok(())
}

/// Opens (or creates) the database file and its tables.
///
/// # Errors
///
/// Returns [`BackendError::Unavailable`] if the file cannot be opened.
pub fn open_database(path: &Path) -> BackendResult<Database> {
    let db = Database::create(path)?;
    let txn = db.begin_write()?;
    create_tables(&txn)?;
    txn.commit()?;
    debug!(path = %path.display(), "opened redb datastore");
    Ok(db)
}

/// Opens [`RedbBackend`] connections to one database file.
///
/// The file is opened on the first connect and shared by every later
/// connection, since redb holds an exclusive lock per process.
pub struct RedbConnector {
    path: PathBuf,
    db: Mutex<Option<Arc<Database>>>,
}

impl RedbConnector {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            db: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for RedbConnector {
    async fn connect(&self) -> BackendResult<Box<dyn DatumBackend>> {
        let db = {
            let mut slot = self.db.lock();
            if let Some(db) = slot.as_ref() {
                Arc::clone(db)
            } else {
                let db = Arc::new(open_database(&self.path)?);
                *slot = Some(Arc::clone(&db));
                db
            }
        };
        Ok(Box::new(RedbBackend { db }))
    }

    fn describe(&self) -> String {
        format!("redb:{}", self.path.display())
    }
}

/// One connection to a redb datastore file.
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Modifies one row inside a write transaction, keeping indices in step.
    fn modify(&self, uid: Uid, change: impl FnOnce(&mut Datum)) -> BackendResult<bool> {
        let txn = self.db.begin_write()?;
        {
            let mut rows = txn.open_table(ROWS)?;
            let Some(current) = rows.get(uid.0)?.map(|g| decode(g.value())).transpose()? else {
                return Ok(false);
            };
            let mut next = current.clone();
            change(&mut next);
            rows.insert(uid.0, encode(&next)?.as_slice())?;
            remove_entries(&txn, &current)?;
            add_entries(&txn, &next)?;
        }
        txn.commit()?;
        Ok(true)
    }
}

#[async_trait]
impl DatumBackend for RedbBackend {
    async fn insert(&mut self, pending: &PendingDatum) -> BackendResult<Uid> {
        let txn = self.db.begin_write()?;
        let uid = {
            let mut meta = txn.open_table(META)?;
            let uid = Uid(counter(&meta, LAST_UID)? + 1);
            let row = pending.clone().with_uid(uid);
            let payload = counter(&meta, PAYLOAD)? + row.size();
            meta.insert(LAST_UID, uid.0)?;
            meta.insert(PAYLOAD, payload)?;

            let mut rows = txn.open_table(ROWS)?;
            rows.insert(uid.0, encode(&row)?.as_slice())?;
            add_entries(&txn, &row)?;
            uid
        };
        txn.commit()?;
        Ok(uid)
    }

    async fn update(
        &mut self,
        uid: Uid,
        priority_delta: i32,
        expiration: AbsoluteTime,
    ) -> BackendResult<bool> {
        self.modify(uid, |row| {
            row.priority = datum::merge_priority(row.priority, priority_delta);
            row.expiration = datum::merge_expiration(row.expiration, expiration);
        })
    }

    async fn decrement_replication(&mut self, uid: Uid) -> BackendResult<bool> {
        self.modify(uid, |row| {
            row.replication = datum::decrement_replication(row.replication);
        })
    }

    async fn delete(&mut self, uid: Uid) -> BackendResult<Option<u64>> {
        let txn = self.db.begin_write()?;
        let size = {
            let mut rows = txn.open_table(ROWS)?;
            let Some(row) = rows.remove(uid.0)?.map(|g| decode(g.value())).transpose()? else {
                return Ok(None);
            };
            remove_entries(&txn, &row)?;
            let mut meta = txn.open_table(META)?;
            let payload = counter(&meta, PAYLOAD)?.saturating_sub(row.size());
            meta.insert(PAYLOAD, payload)?;
            row.size()
        };
        txn.commit()?;
        Ok(Some(size))
    }

    async fn count(&mut self, selection: &Selection) -> BackendResult<u64> {
        let txn = self.db.begin_read()?;
        let mut count = 0u64;
        scan(&txn, selection, |_| {
            count += 1;
            true
        })?;
        Ok(count)
    }

    async fn nth(&mut self, selection: &Selection, index: u64) -> BackendResult<Option<Datum>> {
        let txn = self.db.begin_read()?;
        let mut position = 0u64;
        let mut found = None;
        scan(&txn, selection, |uid| {
            if position == index {
                found = Some(uid);
                return false;
            }
            position += 1;
            true
        })?;
        let Some(uid) = found else {
            return Ok(None);
        };
        let rows = txn.open_table(ROWS)?;
        load(&rows, uid).map(Some)
    }

    async fn max_replication(&mut self) -> BackendResult<Option<u32>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(REPLICATION_INDEX)?;
        let mut entries = table.iter()?;
        let Some(entry) = entries.next_back() else {
            return Ok(None);
        };
        let (key, _) = entry?;
        let replication = read_u32(key.value())?;
        Ok(Some(replication))
    }

    async fn ring_successor(
        &mut self,
        replication: u32,
        from: u64,
    ) -> BackendResult<Option<Datum>> {
        let txn = self.db.begin_read()?;
        let low = Composite::new().u32(replication).u64(from).finish();
        let (_, high) = Composite::new().u32(replication).span(16);
        first_in(&txn, REPLICATION_INDEX, &low, &high)
    }

    async fn soonest_expired(&mut self, before: AbsoluteTime) -> BackendResult<Option<Datum>> {
        let txn = self.db.begin_read()?;
        let (low, high) = Composite::new().span(16);
        let candidate = first_in(&txn, EXPIRATION_INDEX, &low, &high)?;
        Ok(candidate.filter(|d| d.is_expired(before)))
    }

    async fn lowest_priority(&mut self) -> BackendResult<Option<Datum>> {
        let txn = self.db.begin_read()?;
        let (low, high) = Composite::new().span(12);
        first_in(&txn, PRIORITY_INDEX, &low, &high)
    }

    async fn payload(&mut self) -> BackendResult<u64> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(META)?;
        counter(&meta, PAYLOAD)
    }

    async fn keys(&mut self) -> BackendResult<Vec<HashCode>> {
        let txn = self.db.begin_read()?;
        let rows = txn.open_table(ROWS)?;
        let mut keys = Vec::new();
        for entry in rows.iter()? {
            let (_, row) = entry?;
            keys.push(decode(row.value())?.key);
        }
        Ok(keys)
    }

    async fn drop_all(&mut self) -> BackendResult<u64> {
        let txn = self.db.begin_write()?;
        let freed = {
            let mut meta = txn.open_table(META)?;
            let freed = counter(&meta, PAYLOAD)?;
            meta.insert(PAYLOAD, 0)?;
            freed
        };
        txn.delete_table(ROWS)?;
        for index in &INDICES {
            txn.delete_table(index.table)?;
        }
        create_tables(&txn)?;
        txn.commit()?;
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use veil_core::{BlockType, NewDatum};

    use super::*;
    use crate::storage::backend::KeyQuery;

    fn pending(key: &[u8], value: &[u8], rvalue: u64) -> PendingDatum {
        NewDatum {
            key: HashCode::digest(key),
            value: value.to_vec(),
            block_type: BlockType::DBLOCK,
            priority: 3,
            anonymity: 0,
            replication: 1,
            expiration: AbsoluteTime::from_micros(5_000),
        }
        .prepare(rvalue)
        .unwrap()
    }

    #[test]
    fn composite_span_covers_suffixes() {
        let (low, high) = Composite::new().u32(7).span(8);
        assert_eq!(low, vec![0, 0, 0, 7]);
        assert_eq!(high, vec![0, 0, 0, 7, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let entry = Composite::new().u32(7).u64(42).finish();
        assert!(low.as_slice() <= entry.as_slice() && entry.as_slice() <= high.as_slice());
    }

    #[tokio::test]
    async fn row_round_trips_through_storage() {
        let dir = tempdir().unwrap();
        let connector = RedbConnector::new(dir.path().join("store.redb"));
        let mut backend = connector.connect().await.unwrap();

        let original = pending(b"k", b"value", 11);
        let uid = backend.insert(&original).await.unwrap();
        let selection = Selection::Key(KeyQuery::any(HashCode::digest(b"k")));
        let stored = backend.nth(&selection, 0).await.unwrap().unwrap();
        assert_eq!(stored, original.with_uid(uid));
        assert_eq!(backend.payload().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn data_and_uids_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.redb");

        let first_uid = {
            let connector = RedbConnector::new(&path);
            let mut backend = connector.connect().await.unwrap();
            backend.insert(&pending(b"k", b"one", 0)).await.unwrap()
        };

        let connector = RedbConnector::new(&path);
        let mut backend = connector.connect().await.unwrap();
        assert_eq!(backend.keys().await.unwrap(), vec![HashCode::digest(b"k")]);
        let second_uid = backend.insert(&pending(b"k", b"two", 0)).await.unwrap();
        assert!(second_uid > first_uid);
    }

    #[tokio::test]
    async fn update_moves_index_entries() {
        let dir = tempdir().unwrap();
        let connector = RedbConnector::new(dir.path().join("store.redb"));
        let mut backend = connector.connect().await.unwrap();

        let a = backend.insert(&pending(b"a", b"1", 0)).await.unwrap();
        let b = backend.insert(&pending(b"b", b"2", 0)).await.unwrap();
        assert!(backend
            .update(a, 10, AbsoluteTime::from_micros(9_000))
            .await
            .unwrap());

        assert_eq!(backend.lowest_priority().await.unwrap().unwrap().uid, b);
        let expired = backend
            .soonest_expired(AbsoluteTime::from_micros(6_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.uid, b);
        assert!(!backend
            .update(Uid(999), 1, AbsoluteTime::ZERO)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn ring_successor_and_replication_decrement() {
        let dir = tempdir().unwrap();
        let connector = RedbConnector::new(dir.path().join("store.redb"));
        let mut backend = connector.connect().await.unwrap();

        let low = backend.insert(&pending(b"a", b"1", 100)).await.unwrap();
        let high = backend.insert(&pending(b"b", b"2", 900)).await.unwrap();
        assert_eq!(backend.max_replication().await.unwrap(), Some(1));

        let hit = backend.ring_successor(1, 500).await.unwrap().unwrap();
        assert_eq!(hit.uid, high);
        assert!(backend.ring_successor(1, 901).await.unwrap().is_none());
        assert_eq!(backend.ring_successor(1, 0).await.unwrap().unwrap().uid, low);

        assert!(backend.decrement_replication(high).await.unwrap());
        assert!(backend.ring_successor(1, 500).await.unwrap().is_none());
        assert_eq!(backend.ring_successor(0, 0).await.unwrap().unwrap().uid, high);
    }

    #[tokio::test]
    async fn delete_and_drop_track_payload() {
        let dir = tempdir().unwrap();
        let connector = RedbConnector::new(dir.path().join("store.redb"));
        let mut backend = connector.connect().await.unwrap();

        let uid = backend.insert(&pending(b"a", b"1234", 0)).await.unwrap();
        backend.insert(&pending(b"b", b"56", 0)).await.unwrap();
        assert_eq!(backend.delete(uid).await.unwrap(), Some(4));
        assert_eq!(backend.delete(uid).await.unwrap(), None);
        assert_eq!(backend.payload().await.unwrap(), 2);

        assert_eq!(backend.drop_all().await.unwrap(), 2);
        assert_eq!(backend.drop_all().await.unwrap(), 0);
        assert!(backend.keys().await.unwrap().is_empty());
        assert_eq!(backend.max_replication().await.unwrap(), None);
        let next = backend.insert(&pending(b"c", b"7", 0)).await.unwrap();
        assert!(next > uid);
    }

    #[tokio::test]
    async fn type_filter_applies_with_vhash() {
        let dir = tempdir().unwrap();
        let connector = RedbConnector::new(dir.path().join("store.redb"));
        let mut backend = connector.connect().await.unwrap();

        backend.insert(&pending(b"k", b"same", 0)).await.unwrap();
        let mut other = pending(b"k", b"same", 0);
        other.block_type = BlockType::IBLOCK;
        let other = backend.insert(&other).await.unwrap();

        let query = KeyQuery::any(HashCode::digest(b"k")).with_vhash(HashCode::digest(b"same"));
        assert_eq!(backend.count(&Selection::Key(query)).await.unwrap(), 2);
        let typed = Selection::Key(query.with_type(BlockType::IBLOCK));
        assert_eq!(backend.count(&typed).await.unwrap(), 1);
        assert_eq!(backend.nth(&typed, 0).await.unwrap().unwrap().uid, other);
    }
}
