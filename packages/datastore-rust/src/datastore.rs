//! The datastore facade.
//!
//! [`Datastore`] is the contract the host service talks to. It validates
//! input, draws randomness, runs the selection policies from
//! [`crate::select`] against its [`Session`], applies caller verdicts, and
//! reports every payload change to the [`UsageObserver`].
//!
//! Read operations hand their result to a caller-supplied processor. The
//! processor sees `Some(datum)` for a hit or `None` when nothing qualified,
//! and answers with a [`Verdict`].

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};
use veil_core::{AbsoluteTime, BlockType, ClockSource, Datum, HashCode, NewDatum, Uid};

use crate::config::DatastoreConfig;
use crate::error::{BackendError, DatastoreError};
use crate::factory::DatastoreFactory;
use crate::select;
use crate::storage::{DatumBackend, KeyQuery, Selection, Session};
use crate::usage::UsageObserver;

/// A processor's answer after seeing a datum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Leave the datum in place.
    Keep,
    /// Delete the visited datum.
    Delete,
    /// Stop without further action.
    Abort,
}

fn count(op: &'static str) {
    metrics::counter!("datastore_operations_total", "op" => op).increment(1);
}

fn failed(op: &'static str) -> impl FnOnce(BackendError) -> DatastoreError {
    move |err| {
        metrics::counter!("datastore_errors_total", "op" => op).increment(1);
        warn!(op, error = %err, "datastore operation failed");
        DatastoreError::Storage(err)
    }
}

fn negative(bytes: u64) -> i64 {
    i64::try_from(bytes).map_or(i64::MIN, |b| -b)
}

/// A content block store over one backend connection.
///
/// Takes `&mut self` everywhere: one instance serves one request at a time.
/// Run independent instances for concurrency.
pub struct Datastore {
    session: Session,
    usage: Arc<dyn UsageObserver>,
    clock: Arc<dyn ClockSource>,
}

impl Datastore {
    #[must_use]
    pub fn new(
        session: Session,
        usage: Arc<dyn UsageObserver>,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        Self {
            session,
            usage,
            clock,
        }
    }

    /// Connects the configured backend, reporting usage to `usage`.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Config`] if the backend is not compiled in
    /// and [`DatastoreError::Storage`] if it cannot be reached.
    pub async fn from_config(
        config: &DatastoreConfig,
        usage: Arc<dyn UsageObserver>,
    ) -> Result<Self, DatastoreError> {
        let (datastore, _) = DatastoreFactory::new(config.clone(), vec![usage])
            .open()
            .await?;
        Ok(datastore)
    }

    fn report(&self, delta: i64) {
        if delta != 0 {
            self.usage.on_usage_change(delta);
        }
    }

    async fn delete_visited(&mut self, op: &'static str, uid: Uid) -> Result<Option<u64>, DatastoreError> {
        let freed = self.session.delete(uid).await.map_err(failed(op))?;
        if let Some(size) = freed {
            self.report(negative(size));
            debug!(op, %uid, size, "deleted datum");
        }
        Ok(freed)
    }

    /// Hands `found` to `proc` and applies its verdict.
    async fn settle<F>(
        &mut self,
        op: &'static str,
        found: Option<Datum>,
        proc: F,
    ) -> Result<(), DatastoreError>
    where
        F: FnOnce(Option<&Datum>) -> Verdict + Send,
    {
        let verdict = proc(found.as_ref());
        if let (Some(datum), Verdict::Delete) = (found, verdict) {
            self.delete_visited(op, datum.uid).await?;
        }
        Ok(())
    }

    /// Stores a new datum and returns its uid.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Validation`] for an oversized value or the
    /// wildcard type, without touching storage, and
    /// [`DatastoreError::Storage`] if the insert failed.
    pub async fn put(&mut self, datum: NewDatum) -> Result<Uid, DatastoreError> {
        count("put");
        let rvalue: u64 = rand::rng().random();
        let pending = datum.prepare(rvalue).inspect_err(|err| {
            metrics::counter!("datastore_errors_total", "op" => "put").increment(1);
            debug!(error = %err, "rejected datum");
        })?;
        let size = pending.value.len() as u64;
        let uid = self.session.insert(&pending).await.map_err(failed("put"))?;
        self.report(i64::try_from(size).unwrap_or(i64::MAX));
        debug!(%uid, key = %pending.key.short(), size, "stored datum");
        Ok(uid)
    }

    /// Adds `priority_delta` to a datum's priority (clamped at 0) and raises
    /// its expiration to `expiration` if that is later.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::UnknownUid`] if no such datum exists.
    pub async fn update(
        &mut self,
        uid: Uid,
        priority_delta: i32,
        expiration: AbsoluteTime,
    ) -> Result<(), DatastoreError> {
        count("update");
        let found = self
            .session
            .update(uid, priority_delta, expiration)
            .await
            .map_err(failed("update"))?;
        if found {
            Ok(())
        } else {
            Err(DatastoreError::UnknownUid(uid))
        }
    }

    /// Visits the match at position `offset mod count` among datums matching
    /// `query`, in uid order.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed.
    pub async fn get_key<F>(
        &mut self,
        offset: u64,
        query: KeyQuery,
        proc: F,
    ) -> Result<(), DatastoreError>
    where
        F: FnOnce(Option<&Datum>) -> Verdict + Send,
    {
        count("get_key");
        let found = select::uniform(&mut self.session, &Selection::Key(query), offset)
            .await
            .map_err(failed("get_key"))?;
        self.settle("get_key", found, proc).await
    }

    /// Visits a random datum among those owing the most replications, after
    /// decrementing its replication counter.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed.
    pub async fn get_replication<F>(&mut self, proc: F) -> Result<(), DatastoreError>
    where
        F: FnOnce(Option<&Datum>) -> Verdict + Send,
    {
        count("get_replication");
        let r: u64 = rand::rng().random();
        let found = select::replication(&mut self.session, r)
            .await
            .map_err(failed("get_replication"))?;
        self.settle("get_replication", found, proc).await
    }

    /// Visits the match at position `offset mod count` among anonymity-0
    /// datums of `block_type`.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed.
    pub async fn get_zero_anonymity<F>(
        &mut self,
        offset: u64,
        block_type: BlockType,
        proc: F,
    ) -> Result<(), DatastoreError>
    where
        F: FnOnce(Option<&Datum>) -> Verdict + Send,
    {
        count("get_zero_anonymity");
        let selection = Selection::ZeroAnonymity(block_type);
        let found = select::uniform(&mut self.session, &selection, offset)
            .await
            .map_err(failed("get_zero_anonymity"))?;
        self.settle("get_zero_anonymity", found, proc).await
    }

    /// Visits the best eviction victim: the soonest-expired datum, or the
    /// lowest-priority datum when nothing has expired yet.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed.
    pub async fn get_expiration<F>(&mut self, proc: F) -> Result<(), DatastoreError>
    where
        F: FnOnce(Option<&Datum>) -> Verdict + Send,
    {
        count("get_expiration");
        let now = self.clock.now();
        let found = select::eviction_candidate(&mut self.session, now)
            .await
            .map_err(failed("get_expiration"))?;
        self.settle("get_expiration", found, proc).await
    }

    /// Streams every stored key, then calls `proc(None)` once.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed; `proc` is
    /// not called in that case.
    pub async fn get_keys<F>(&mut self, mut proc: F) -> Result<(), DatastoreError>
    where
        F: FnMut(Option<&HashCode>) + Send,
    {
        count("get_keys");
        let keys = self.session.keys().await.map_err(failed("get_keys"))?;
        for key in &keys {
            proc(Some(key));
        }
        proc(None);
        Ok(())
    }

    /// Total payload bytes stored.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed.
    pub async fn estimate_size(&mut self) -> Result<u64, DatastoreError> {
        count("estimate_size");
        self.session.payload().await.map_err(failed("estimate_size"))
    }

    /// Deletes every datum. Dropping an empty store is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed; the store
    /// is left as it was.
    pub async fn drop(&mut self) -> Result<(), DatastoreError> {
        count("drop");
        let freed = self.session.drop_all().await.map_err(failed("drop"))?;
        self.report(negative(freed));
        info!(target = %self.session.target(), freed, "dropped all datums");
        Ok(())
    }

    /// Deletes one datum stored under `key` whose value is exactly `value`.
    ///
    /// Returns `false` if nothing matched.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed.
    pub async fn remove(
        &mut self,
        key: HashCode,
        value: &[u8],
        block_type: BlockType,
    ) -> Result<bool, DatastoreError> {
        count("remove");
        let query = KeyQuery::any(key)
            .with_vhash(HashCode::digest(value))
            .with_type(block_type);
        let found = select::uniform(&mut self.session, &Selection::Key(query), 0)
            .await
            .map_err(failed("remove"))?;
        let Some(datum) = found else {
            return Ok(false);
        };
        Ok(self.delete_visited("remove", datum.uid).await?.is_some())
    }

    /// Deletes every datum whose expiration is before `now`, soonest first.
    /// Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed; datums
    /// deleted before the failure stay deleted.
    pub async fn purge_expired(&mut self, now: AbsoluteTime) -> Result<u64, DatastoreError> {
        count("purge_expired");
        let mut purged = 0;
        while let Some(datum) = self
            .session
            .soonest_expired(now)
            .await
            .map_err(failed("purge_expired"))?
        {
            if self.delete_visited("purge_expired", datum.uid).await?.is_none() {
                break;
            }
            purged += 1;
        }
        if purged > 0 {
            info!(purged, "purged expired datums");
        }
        Ok(purged)
    }

    /// Evicts datums in eviction order until at least `bytes` were freed or
    /// the store is empty. Returns the bytes freed.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Storage`] if the backend failed.
    pub async fn make_room(&mut self, bytes: u64) -> Result<u64, DatastoreError> {
        count("make_room");
        let mut freed = 0;
        while freed < bytes {
            let now = self.clock.now();
            let Some(victim) = select::eviction_candidate(&mut self.session, now)
                .await
                .map_err(failed("make_room"))?
            else {
                break;
            };
            match self.delete_visited("make_room", victim.uid).await? {
                Some(size) => freed += size,
                None => break,
            }
        }
        debug!(requested = bytes, freed, "made room");
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;

    use veil_core::{FixedClock, MAX_DATUM_SIZE};

    use super::*;
    use crate::storage::backends::MemoryConnector;
    use crate::storage::RetryPolicy;

    const NOW: u64 = 1_000_000;

    #[derive(Default)]
    struct Ledger(AtomicI64);

    impl UsageObserver for Ledger {
        fn on_usage_change(&self, delta: i64) {
            self.0.fetch_add(delta, Ordering::SeqCst);
        }
    }

    impl Ledger {
        fn total(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        store: Datastore,
        ledger: Arc<Ledger>,
        connector: MemoryConnector,
    }

    async fn harness() -> Harness {
        let connector = MemoryConnector::new();
        let session = Session::open(Arc::new(connector.clone()), RetryPolicy::default())
            .await
            .unwrap();
        let ledger = Arc::new(Ledger::default());
        let store = Datastore::new(
            session,
            Arc::clone(&ledger) as Arc<dyn UsageObserver>,
            Arc::new(FixedClock(AbsoluteTime::from_micros(NOW))),
        );
        Harness {
            store,
            ledger,
            connector,
        }
    }

    fn datum(key: &[u8], value: &[u8]) -> NewDatum {
        NewDatum {
            key: HashCode::digest(key),
            value: value.to_vec(),
            block_type: BlockType::DBLOCK,
            priority: 5,
            anonymity: 1,
            replication: 0,
            expiration: AbsoluteTime::from_micros(NOW * 10),
        }
    }

    /// Runs a single-result read and returns what the processor saw.
    macro_rules! visit {
        ($store:expr, $op:ident ( $($arg:expr),* ), $verdict:expr) => {{
            let seen = Mutex::new(None);
            $store
                .$op($($arg,)* |d: Option<&Datum>| {
                    *seen.lock().unwrap() = Some(d.cloned());
                    $verdict
                })
                .await
                .unwrap();
            seen.into_inner().unwrap().expect("processor was not called")
        }};
    }

    #[tokio::test]
    async fn put_then_get_key_round_trips() {
        let mut h = harness().await;
        let mut input = datum(b"k", b"payload");
        input.anonymity = 2;
        input.replication = 3;
        let uid = h.store.put(input.clone()).await.unwrap();

        let query = KeyQuery::any(input.key).with_type(BlockType::DBLOCK);
        let got = visit!(h.store, get_key(0, query), Verdict::Keep).unwrap();
        assert_eq!(got.uid, uid);
        assert_eq!(got.value, input.value);
        assert_eq!(got.block_type, input.block_type);
        assert_eq!(got.priority, input.priority);
        assert_eq!(got.anonymity, input.anonymity);
        assert_eq!(got.expiration, input.expiration);
        assert_eq!(got.vhash, HashCode::digest(b"payload"));
        assert_eq!(h.ledger.total(), 7);
    }

    #[tokio::test]
    async fn uids_are_fresh() {
        let mut h = harness().await;
        let a = h.store.put(datum(b"k", b"a")).await.unwrap();
        let b = h.store.put(datum(b"k", b"a")).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn oversized_put_is_rejected_without_side_effects() {
        let mut h = harness().await;
        h.store.put(datum(b"k", b"seed")).await.unwrap();
        let before = h.store.estimate_size().await.unwrap();

        let err = h
            .store
            .put(datum(b"k", &vec![0u8; MAX_DATUM_SIZE + 1]))
            .await
            .unwrap_err();
        assert!(matches!(err, DatastoreError::Validation(_)));
        assert_eq!(h.store.estimate_size().await.unwrap(), before);
        assert_eq!(h.ledger.total(), 4);
    }

    #[tokio::test]
    async fn wildcard_type_put_is_rejected() {
        let mut h = harness().await;
        let mut input = datum(b"k", b"v");
        input.block_type = BlockType::ANY;
        assert!(matches!(
            h.store.put(input).await,
            Err(DatastoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn empty_value_reports_no_usage() {
        let mut h = harness().await;
        h.store.put(datum(b"k", b"")).await.unwrap();
        assert_eq!(h.ledger.total(), 0);
        assert_eq!(h.store.estimate_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_merges_priority_and_expiration() {
        let mut h = harness().await;
        let e = NOW * 10;
        let uid = h.store.put(datum(b"k", b"v")).await.unwrap();
        let query = KeyQuery::any(HashCode::digest(b"k"));

        h.store
            .update(uid, 3, AbsoluteTime::from_micros(e - 1_000))
            .await
            .unwrap();
        let got = visit!(h.store, get_key(0, query), Verdict::Keep).unwrap();
        assert_eq!(got.priority, 8);
        assert_eq!(got.expiration, AbsoluteTime::from_micros(e));

        h.store
            .update(uid, -100, AbsoluteTime::from_micros(e + 1_000))
            .await
            .unwrap();
        let got = visit!(h.store, get_key(0, query), Verdict::Keep).unwrap();
        assert_eq!(got.priority, 0);
        assert_eq!(got.expiration, AbsoluteTime::from_micros(e + 1_000));
    }

    #[tokio::test]
    async fn update_of_unknown_uid_fails_harmlessly() {
        let mut h = harness().await;
        h.store.put(datum(b"k", b"v")).await.unwrap();
        let err = h
            .store
            .update(Uid(404), 1, AbsoluteTime::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, DatastoreError::UnknownUid(Uid(404))));
        assert_eq!(h.store.estimate_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_key_offsets_cycle_in_uid_order() {
        let mut h = harness().await;
        let mut uids = Vec::new();
        for value in [b"a", b"b", b"c"] {
            uids.push(h.store.put(datum(b"shared", value)).await.unwrap());
        }
        h.store.put(datum(b"other", b"x")).await.unwrap();

        let query = KeyQuery::any(HashCode::digest(b"shared"));
        let mut visited = Vec::new();
        for offset in 0..5 {
            let got = visit!(h.store, get_key(offset, query), Verdict::Keep).unwrap();
            visited.push(got.uid);
        }
        assert_eq!(visited, vec![uids[0], uids[1], uids[2], uids[0], uids[1]]);
    }

    #[tokio::test]
    async fn get_key_filters_by_vhash() {
        let mut h = harness().await;
        h.store.put(datum(b"k", b"first")).await.unwrap();
        let second = h.store.put(datum(b"k", b"second")).await.unwrap();

        let query = KeyQuery::any(HashCode::digest(b"k")).with_vhash(HashCode::digest(b"second"));
        for offset in 0..3 {
            let got = visit!(h.store, get_key(offset, query), Verdict::Keep).unwrap();
            assert_eq!(got.uid, second);
        }
    }

    #[tokio::test]
    async fn get_key_miss_signals_none() {
        let mut h = harness().await;
        let query = KeyQuery::any(HashCode::digest(b"absent"));
        assert!(visit!(h.store, get_key(0, query), Verdict::Delete).is_none());
    }

    #[tokio::test]
    async fn replication_decrements_to_zero_and_moves_on() {
        let mut h = harness().await;
        let mut owed = datum(b"owed", b"1");
        owed.replication = 2;
        let owed = h.store.put(owed).await.unwrap();
        let mut other = datum(b"other", b"2");
        other.replication = 1;
        let other = h.store.put(other).await.unwrap();

        let first = visit!(h.store, get_replication(), Verdict::Keep).unwrap();
        assert_eq!((first.uid, first.replication), (owed, 1));

        // Both now hold replication 1; draw until each has been served once.
        let second = visit!(h.store, get_replication(), Verdict::Keep).unwrap();
        let third = visit!(h.store, get_replication(), Verdict::Keep).unwrap();
        let mut served = vec![second.uid, third.uid];
        served.sort();
        assert_eq!(served, vec![owed, other]);
        assert_eq!(second.replication, 0);
        assert_eq!(third.replication, 0);

        let fourth = visit!(h.store, get_replication(), Verdict::Keep).unwrap();
        assert_eq!(fourth.replication, 0);
    }

    #[tokio::test]
    async fn replication_on_empty_store_signals_none() {
        let mut h = harness().await;
        assert!(visit!(h.store, get_replication(), Verdict::Keep).is_none());
    }

    #[tokio::test]
    async fn zero_anonymity_only_surfaces_anonymity_zero() {
        let mut h = harness().await;
        for (i, anonymity) in [0u32, 1, 2, 0, 1].into_iter().enumerate() {
            let mut input = datum(format!("k{i}").as_bytes(), b"v");
            input.anonymity = anonymity;
            h.store.put(input).await.unwrap();
        }

        for offset in 0..4 {
            let got = visit!(
                h.store,
                get_zero_anonymity(offset, BlockType::ANY),
                Verdict::Keep
            )
            .unwrap();
            assert_eq!(got.anonymity, 0);
        }

        for _ in 0..2 {
            let got = visit!(
                h.store,
                get_zero_anonymity(0, BlockType::DBLOCK),
                Verdict::Delete
            )
            .unwrap();
            assert_eq!(got.anonymity, 0);
        }
        assert!(visit!(
            h.store,
            get_zero_anonymity(0, BlockType::ANY),
            Verdict::Keep
        )
        .is_none());
        assert_eq!(h.store.estimate_size().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn expiration_prefers_expired_then_lowest_priority() {
        let mut h = harness().await;
        let mut stale = datum(b"stale", b"s");
        stale.priority = 900;
        stale.expiration = AbsoluteTime::from_micros(NOW - 1);
        let stale = h.store.put(stale).await.unwrap();
        for (key, priority) in [(b"a", 50u32), (b"b", 7), (b"c", 300)] {
            let mut input = datum(key, b"v");
            input.priority = priority;
            h.store.put(input).await.unwrap();
        }

        let got = visit!(h.store, get_expiration(), Verdict::Keep).unwrap();
        assert_eq!(got.uid, stale);

        h.store.update(stale, 0, AbsoluteTime::FOREVER).await.unwrap();
        let got = visit!(h.store, get_expiration(), Verdict::Keep).unwrap();
        assert_eq!(got.priority, 7);
    }

    #[tokio::test]
    async fn expiration_on_empty_store_signals_none() {
        let mut h = harness().await;
        assert!(visit!(h.store, get_expiration(), Verdict::Keep).is_none());
    }

    #[tokio::test]
    async fn drop_empties_store_and_is_idempotent() {
        let mut h = harness().await;
        h.store.put(datum(b"a", b"123")).await.unwrap();
        h.store.put(datum(b"b", b"45")).await.unwrap();

        h.store.drop().await.unwrap();
        assert_eq!(h.store.estimate_size().await.unwrap(), 0);
        assert_eq!(h.ledger.total(), 0);

        h.store.drop().await.unwrap();
        assert_eq!(h.store.estimate_size().await.unwrap(), 0);
        assert_eq!(h.ledger.total(), 0);
    }

    #[tokio::test]
    async fn delete_verdict_removes_visited_datum() {
        let mut h = harness().await;
        let mut victim = datum(b"victim", b"twelve bytes");
        victim.priority = 0;
        h.store.put(victim).await.unwrap();
        h.store.put(datum(b"keeper", b"kept")).await.unwrap();
        let before = h.store.estimate_size().await.unwrap();

        let got = visit!(h.store, get_expiration(), Verdict::Delete).unwrap();
        assert_eq!(got.key, HashCode::digest(b"victim"));

        let mut keys = Vec::new();
        h.store
            .get_keys(|k| {
                if let Some(k) = k {
                    keys.push(*k);
                }
            })
            .await
            .unwrap();
        assert_eq!(keys, vec![HashCode::digest(b"keeper")]);
        assert_eq!(h.store.estimate_size().await.unwrap(), before - 12);
        assert_eq!(h.ledger.total(), 4);
    }

    #[tokio::test]
    async fn abort_verdict_leaves_datum() {
        let mut h = harness().await;
        h.store.put(datum(b"k", b"v")).await.unwrap();
        let got = visit!(h.store, get_expiration(), Verdict::Abort);
        assert!(got.is_some());
        assert_eq!(h.store.estimate_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_keys_streams_duplicates_then_completes() {
        let mut h = harness().await;
        h.store.put(datum(b"dup", b"1")).await.unwrap();
        h.store.put(datum(b"dup", b"2")).await.unwrap();
        h.store.put(datum(b"solo", b"3")).await.unwrap();

        let mut calls = Vec::new();
        h.store.get_keys(|k| calls.push(k.copied())).await.unwrap();
        assert_eq!(
            calls,
            vec![
                Some(HashCode::digest(b"dup")),
                Some(HashCode::digest(b"dup")),
                Some(HashCode::digest(b"solo")),
                None
            ]
        );
    }

    #[tokio::test]
    async fn remove_matches_value() {
        let mut h = harness().await;
        let key = HashCode::digest(b"k");
        h.store.put(datum(b"k", b"keep")).await.unwrap();
        h.store.put(datum(b"k", b"drop")).await.unwrap();

        assert!(h.store.remove(key, b"drop", BlockType::ANY).await.unwrap());
        assert!(!h.store.remove(key, b"drop", BlockType::ANY).await.unwrap());
        assert!(!h.store.remove(key, b"keep", BlockType::IBLOCK).await.unwrap());
        assert_eq!(h.store.estimate_size().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn purge_expired_removes_only_expired() {
        let mut h = harness().await;
        for (key, expiration) in [(b"a", NOW - 10), (b"b", NOW - 5), (b"c", NOW + 5)] {
            let mut input = datum(key, b"v");
            input.expiration = AbsoluteTime::from_micros(expiration);
            h.store.put(input).await.unwrap();
        }
        let purged = h
            .store
            .purge_expired(AbsoluteTime::from_micros(NOW))
            .await
            .unwrap();
        assert_eq!(purged, 2);
        assert_eq!(h.store.estimate_size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn make_room_evicts_lowest_value_first() {
        let mut h = harness().await;
        for (key, priority) in [(b"a", 3u32), (b"b", 1), (b"c", 2)] {
            let mut input = datum(key, b"0123456789");
            input.priority = priority;
            h.store.put(input).await.unwrap();
        }

        assert_eq!(h.store.make_room(15).await.unwrap(), 20);
        let mut keys = Vec::new();
        h.store
            .get_keys(|k| keys.extend(k.copied()))
            .await
            .unwrap();
        assert_eq!(keys, vec![HashCode::digest(b"a")]);
        assert_eq!(h.store.make_room(1_000).await.unwrap(), 10);
        assert_eq!(h.store.make_room(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_put_leaves_state_and_reports_storage_error() {
        let mut h = harness().await;
        h.connector.inject_failures(1);
        let err = h.store.put(datum(b"k", b"v")).await.unwrap_err();
        assert!(err.is_storage());
        assert_eq!(h.ledger.total(), 0);
        assert_eq!(h.store.estimate_size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reads_recover_from_a_transient_failure() {
        let mut h = harness().await;
        h.store.put(datum(b"k", b"v")).await.unwrap();
        h.connector.inject_failures(1);
        let query = KeyQuery::any(HashCode::digest(b"k"));
        assert!(visit!(h.store, get_key(0, query), Verdict::Keep).is_some());
    }

    #[tokio::test]
    async fn exhausted_backend_surfaces_storage_error() {
        let mut h = harness().await;
        h.connector.inject_failures(1);
        h.connector.refuse_connects(u32::MAX);
        let err = h.store.estimate_size().await.unwrap_err();
        assert!(err.is_storage());
    }
}
