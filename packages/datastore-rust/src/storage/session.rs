//! Connection ownership and failure recovery.
//!
//! A [`Session`] holds at most one live backend connection. The link is in
//! one of two states:
//!
//! - `Connected`: calls go straight to the backend.
//! - `Invalidated`: the previous connection failed and was dropped along
//!   with everything prepared on it. The next call reconnects through the
//!   [`Connector`] before executing.
//!
//! Any backend error moves the link from `Connected` to `Invalidated`. Reads
//! are re-issued on the fresh connection up to
//! [`RetryPolicy::read_retries`] times. Mutations are never re-issued: the
//! backend applies each mutation atomically, so a failed one left storage
//! untouched and the error goes to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use veil_core::{AbsoluteTime, Datum, HashCode, PendingDatum, Uid};

use crate::error::{BackendError, BackendResult};
use crate::storage::backend::{Connector, DatumBackend, Selection};

/// How hard a [`Session`] tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connection attempts per reconnect. Values below 1 are treated as 1.
    pub reconnect_attempts: u32,
    /// Extra executions of a failed read after reconnecting.
    pub read_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            read_retries: 1,
        }
    }
}

enum Link {
    Connected(Box<dyn DatumBackend>),
    Invalidated,
}

/// Owns the single backend connection of one datastore instance.
pub struct Session {
    connector: Arc<dyn Connector>,
    link: Link,
    policy: RetryPolicy,
    target: String,
}

/// Runs a read, reconnecting and re-issuing it after a failure.
macro_rules! read {
    ($session:ident, $op:literal, |$backend:ident| $call:expr) => {{
        let mut retries = $session.policy.read_retries;
        loop {
            let $backend = $session.backend().await?;
            match $call.await {
                Ok(value) => break Ok(value),
                Err(err) => {
                    $session.invalidate($op, &err);
                    if retries == 0 {
                        break Err(err);
                    }
                    retries -= 1;
                    debug!(op = $op, retries_left = retries, "retrying read");
                }
            }
        }
    }};
}

/// Runs a mutation once; a failure invalidates the link and is returned.
macro_rules! mutate {
    ($session:ident, $op:literal, |$backend:ident| $call:expr) => {{
        let $backend = $session.backend().await?;
        match $call.await {
            Ok(value) => Ok(value),
            Err(err) => {
                $session.invalidate($op, &err);
                Err(err)
            }
        }
    }};
}

impl Session {
    /// Connects eagerly so configuration errors surface at startup.
    ///
    /// # Errors
    ///
    /// Returns the last connection error once every attempt failed.
    pub async fn open(connector: Arc<dyn Connector>, policy: RetryPolicy) -> BackendResult<Self> {
        let target = connector.describe();
        let mut session = Self {
            connector,
            link: Link::Invalidated,
            policy,
            target,
        };
        session.reconnect().await?;
        info!(target = %session.target, "datastore backend connected");
        Ok(session)
    }

    /// Whether a live connection is currently held.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self.link, Link::Connected(_))
    }

    /// Description of the backend this session talks to.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    async fn backend(&mut self) -> BackendResult<&mut Box<dyn DatumBackend>> {
        if let Link::Invalidated = self.link {
            self.reconnect().await?;
        }
        match &mut self.link {
            Link::Connected(backend) => Ok(backend),
            Link::Invalidated => Err(BackendError::Unavailable(format!(
                "no connection to {}",
                self.target
            ))),
        }
    }

    async fn reconnect(&mut self) -> BackendResult<()> {
        let attempts = self.policy.reconnect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.connector.connect().await {
                Ok(backend) => {
                    self.link = Link::Connected(backend);
                    if attempt > 1 {
                        info!(target = %self.target, attempt, "reconnected to backend");
                    }
                    return Ok(());
                }
                Err(err) => {
                    warn!(target = %self.target, attempt, attempts, error = %err, "backend connect failed");
                    last_error = Some(err);
                }
            }
        }
        error!(target = %self.target, attempts, "giving up on backend connection");
        Err(last_error.unwrap_or_else(|| {
            BackendError::Unavailable(format!("could not connect to {}", self.target))
        }))
    }

    fn invalidate(&mut self, op: &'static str, err: &BackendError) {
        if self.is_connected() {
            warn!(target = %self.target, op, error = %err, "backend failed, invalidating connection");
        }
        self.link = Link::Invalidated;
    }
}

#[async_trait]
impl DatumBackend for Session {
    async fn insert(&mut self, datum: &PendingDatum) -> BackendResult<Uid> {
        mutate!(self, "insert", |backend| backend.insert(datum))
    }

    async fn update(
        &mut self,
        uid: Uid,
        priority_delta: i32,
        expiration: AbsoluteTime,
    ) -> BackendResult<bool> {
        mutate!(self, "update", |backend| backend.update(
            uid,
            priority_delta,
            expiration
        ))
    }

    async fn decrement_replication(&mut self, uid: Uid) -> BackendResult<bool> {
        mutate!(self, "decrement_replication", |backend| backend
            .decrement_replication(uid))
    }

    async fn delete(&mut self, uid: Uid) -> BackendResult<Option<u64>> {
        mutate!(self, "delete", |backend| backend.delete(uid))
    }

    async fn count(&mut self, selection: &Selection) -> BackendResult<u64> {
        read!(self, "count", |backend| backend.count(selection))
    }

    async fn nth(&mut self, selection: &Selection, index: u64) -> BackendResult<Option<Datum>> {
        read!(self, "nth", |backend| backend.nth(selection, index))
    }

    async fn max_replication(&mut self) -> BackendResult<Option<u32>> {
        read!(self, "max_replication", |backend| backend.max_replication())
    }

    async fn ring_successor(
        &mut self,
        replication: u32,
        from: u64,
    ) -> BackendResult<Option<Datum>> {
        read!(self, "ring_successor", |backend| backend
            .ring_successor(replication, from))
    }

    async fn soonest_expired(&mut self, before: AbsoluteTime) -> BackendResult<Option<Datum>> {
        read!(self, "soonest_expired", |backend| backend.soonest_expired(before))
    }

    async fn lowest_priority(&mut self) -> BackendResult<Option<Datum>> {
        read!(self, "lowest_priority", |backend| backend.lowest_priority())
    }

    async fn payload(&mut self) -> BackendResult<u64> {
        read!(self, "payload", |backend| backend.payload())
    }

    async fn keys(&mut self) -> BackendResult<Vec<HashCode>> {
        read!(self, "keys", |backend| backend.keys())
    }

    async fn drop_all(&mut self) -> BackendResult<u64> {
        mutate!(self, "drop_all", |backend| backend.drop_all())
    }
}
