//! In-process [`DatumBackend`] over ordered maps.
//!
//! Rows live in a `BTreeMap` keyed by uid, with one `BTreeSet` per secondary
//! index. Each set holds tuples whose last component is the uid, so a range
//! scan over a tuple prefix yields exactly the order the corresponding
//! persistent index would. All connections opened by one
//! [`MemoryConnector`] share the same tables, so dropping a connection after
//! a failure loses nothing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use veil_core::{datum, AbsoluteTime, Datum, HashCode, PendingDatum, Uid};

use crate::error::{BackendError, BackendResult};
use crate::storage::backend::{Connector, DatumBackend, KeyQuery, Selection};

#[derive(Default)]
struct Tables {
    rows: BTreeMap<u64, Datum>,
    by_key: BTreeSet<(HashCode, u64)>,
    by_key_vhash: BTreeSet<(HashCode, HashCode, u64)>,
    by_key_type: BTreeSet<(HashCode, u32, u64)>,
    /// `(anonymity, type, rvalue, uid)`
    by_anonymity: BTreeSet<(u32, u32, u64, u64)>,
    /// `(replication, rvalue, uid)`
    by_replication: BTreeSet<(u32, u64, u64)>,
    by_expiration: BTreeSet<(AbsoluteTime, u64)>,
    by_priority: BTreeSet<(u32, u64)>,
    payload: u64,
    last_uid: u64,
}

impl Tables {
    fn index(&mut self, d: &Datum) {
        let uid = d.uid.0;
        self.by_key.insert((d.key, uid));
        self.by_key_vhash.insert((d.key, d.vhash, uid));
        self.by_key_type.insert((d.key, d.block_type.0, uid));
        self.by_anonymity
            .insert((d.anonymity, d.block_type.0, d.rvalue, uid));
        self.by_replication.insert((d.replication, d.rvalue, uid));
        self.by_expiration.insert((d.expiration, uid));
        self.by_priority.insert((d.priority, uid));
    }

    fn unindex(&mut self, d: &Datum) {
        let uid = d.uid.0;
        self.by_key.remove(&(d.key, uid));
        self.by_key_vhash.remove(&(d.key, d.vhash, uid));
        self.by_key_type.remove(&(d.key, d.block_type.0, uid));
        self.by_anonymity
            .remove(&(d.anonymity, d.block_type.0, d.rvalue, uid));
        self.by_replication.remove(&(d.replication, d.rvalue, uid));
        self.by_expiration.remove(&(d.expiration, uid));
        self.by_priority.remove(&(d.priority, uid));
    }

    /// Applies `change` to a stored row, keeping every index in step.
    fn modify(&mut self, uid: u64, change: impl FnOnce(&mut Datum)) -> bool {
        let Some(mut row) = self.rows.remove(&uid) else {
            return false;
        };
        self.unindex(&row);
        change(&mut row);
        self.index(&row);
        self.rows.insert(uid, row);
        true
    }

    fn key_uids<'a>(&'a self, query: &'a KeyQuery) -> Box<dyn Iterator<Item = u64> + 'a> {
        let key = query.key;
        match (query.vhash, query.block_type) {
            (Some(vhash), block_type) => Box::new(
                self.by_key_vhash
                    .range((key, vhash, 0)..=(key, vhash, u64::MAX))
                    .map(|&(_, _, uid)| uid)
                    .filter(move |uid| {
                        block_type.is_any()
                            || self
                                .rows
                                .get(uid)
                                .is_some_and(|d| block_type.matches(d.block_type))
                    }),
            ),
            (None, block_type) if !block_type.is_any() => Box::new(
                self.by_key_type
                    .range((key, block_type.0, 0)..=(key, block_type.0, u64::MAX))
                    .map(|&(_, _, uid)| uid),
            ),
            (None, _) => Box::new(
                self.by_key
                    .range((key, 0)..=(key, u64::MAX))
                    .map(|&(_, uid)| uid),
            ),
        }
    }

    fn selection_uids<'a>(
        &'a self,
        selection: &'a Selection,
    ) -> Box<dyn Iterator<Item = u64> + 'a> {
        match selection {
            Selection::Key(query) => self.key_uids(query),
            Selection::ZeroAnonymity(block_type) => {
                let (low, high) = if block_type.is_any() {
                    (0, u32::MAX)
                } else {
                    (block_type.0, block_type.0)
                };
                Box::new(
                    self.by_anonymity
                        .range((0, low, 0, 0)..=(0, high, u64::MAX, u64::MAX))
                        .map(|&(_, _, _, uid)| uid),
                )
            }
        }
    }

    fn row(&self, uid: u64) -> BackendResult<Datum> {
        self.rows
            .get(&uid)
            .cloned()
            .ok_or_else(|| BackendError::Corrupt(format!("index refers to missing row {uid}")))
    }
}

/// Injected failure counters shared by a connector and its connections.
#[derive(Default)]
struct Faults {
    operations: AtomicU32,
    connects: AtomicU32,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Opens [`MemoryBackend`] connections over one shared table set.
#[derive(Default, Clone)]
pub struct MemoryConnector {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
    connects: Arc<AtomicU64>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` backend operations fail with a database error.
    pub fn inject_failures(&self, n: u32) {
        self.faults.operations.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` connection attempts fail.
    pub fn refuse_connects(&self, n: u32) {
        self.faults.connects.store(n, Ordering::SeqCst);
    }

    /// Number of successful connections opened so far.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> BackendResult<Box<dyn DatumBackend>> {
        if take(&self.faults.connects) {
            return Err(BackendError::Unavailable("memory backend refused connection".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryBackend {
            tables: Arc::clone(&self.tables),
            faults: Arc::clone(&self.faults),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// One connection to a shared in-memory table set.
pub struct MemoryBackend {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryBackend {
    /// A standalone backend with its own empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::default(),
            faults: Arc::default(),
        }
    }

    fn check(&self) -> BackendResult<()> {
        if take(&self.faults.operations) {
            return Err(BackendError::Database("injected failure".into()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DatumBackend for MemoryBackend {
    async fn insert(&mut self, pending: &PendingDatum) -> BackendResult<Uid> {
        self.check()?;
        let mut tables = self.tables.lock();
        tables.last_uid += 1;
        let uid = Uid(tables.last_uid);
        let row = pending.clone().with_uid(uid);
        tables.payload += row.size();
        tables.index(&row);
        tables.rows.insert(uid.0, row);
        Ok(uid)
    }

    async fn update(
        &mut self,
        uid: Uid,
        priority_delta: i32,
        expiration: AbsoluteTime,
    ) -> BackendResult<bool> {
        self.check()?;
        Ok(self.tables.lock().modify(uid.0, |row| {
            row.priority = datum::merge_priority(row.priority, priority_delta);
            row.expiration = datum::merge_expiration(row.expiration, expiration);
        }))
    }

    async fn decrement_replication(&mut self, uid: Uid) -> BackendResult<bool> {
        self.check()?;
        Ok(self.tables.lock().modify(uid.0, |row| {
            row.replication = datum::decrement_replication(row.replication);
        }))
    }

    async fn delete(&mut self, uid: Uid) -> BackendResult<Option<u64>> {
        self.check()?;
        let mut tables = self.tables.lock();
        let Some(row) = tables.rows.remove(&uid.0) else {
            return Ok(None);
        };
        tables.unindex(&row);
        tables.payload -= row.size();
        Ok(Some(row.size()))
    }

    async fn count(&mut self, selection: &Selection) -> BackendResult<u64> {
        self.check()?;
        let tables = self.tables.lock();
        Ok(tables.selection_uids(selection).count() as u64)
    }

    async fn nth(&mut self, selection: &Selection, index: u64) -> BackendResult<Option<Datum>> {
        self.check()?;
        let tables = self.tables.lock();
        let Ok(index) = usize::try_from(index) else {
            return Ok(None);
        };
        let found = tables
            .selection_uids(selection)
            .nth(index)
            .map(|uid| tables.row(uid))
            .transpose();
        found
    }

    async fn max_replication(&mut self) -> BackendResult<Option<u32>> {
        self.check()?;
        Ok(self.tables.lock().by_replication.last().map(|&(repl, _, _)| repl))
    }

    async fn ring_successor(
        &mut self,
        replication: u32,
        from: u64,
    ) -> BackendResult<Option<Datum>> {
        self.check()?;
        let tables = self.tables.lock();
        tables
            .by_replication
            .range((replication, from, 0)..=(replication, u64::MAX, u64::MAX))
            .next()
            .map(|&(_, _, uid)| tables.row(uid))
            .transpose()
    }

    async fn soonest_expired(&mut self, before: AbsoluteTime) -> BackendResult<Option<Datum>> {
        self.check()?;
        let tables = self.tables.lock();
        tables
            .by_expiration
            .first()
            .filter(|(expiration, _)| expiration.is_before(before))
            .map(|&(_, uid)| tables.row(uid))
            .transpose()
    }

    async fn lowest_priority(&mut self) -> BackendResult<Option<Datum>> {
        self.check()?;
        let tables = self.tables.lock();
        tables
            .by_priority
            .first()
            .map(|&(_, uid)| tables.row(uid))
            .transpose()
    }

    async fn payload(&mut self) -> BackendResult<u64> {
        self.check()?;
        Ok(self.tables.lock().payload)
    }

    async fn keys(&mut self) -> BackendResult<Vec<HashCode>> {
        self.check()?;
        Ok(self.tables.lock().rows.values().map(|d| d.key).collect())
    }

    async fn drop_all(&mut self) -> BackendResult<u64> {
        self.check()?;
        let mut tables = self.tables.lock();
        let freed = tables.payload;
        let last_uid = tables.last_uid;
        *tables = Tables {
            last_uid,
            ..Tables::default()
        };
        Ok(freed)
    }
}
