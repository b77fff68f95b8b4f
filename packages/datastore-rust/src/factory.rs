//! Wiring a [`Datastore`] from configuration.
//!
//! [`DatastoreFactory`] picks the connector for the configured backend,
//! opens a [`Session`], seeds a [`QuotaTracker`] with the payload already on
//! disk, and fans usage deltas out to the tracker plus any registered
//! observers.

use std::sync::Arc;

use tracing::info;
use veil_core::{ClockSource, SystemClock};

use crate::config::{BackendConfig, DatastoreConfig};
use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::storage::backends::MemoryConnector;
use crate::storage::{Connector, DatumBackend, Session};
use crate::usage::{CompositeUsageObserver, QuotaTracker, UsageObserver};

/// Returns the connector for `backend`.
///
/// # Errors
///
/// Returns [`DatastoreError::Config`] if the backend's feature was not
/// compiled in.
pub fn connector_for(backend: &BackendConfig) -> Result<Arc<dyn Connector>, DatastoreError> {
    match backend {
        BackendConfig::Memory => Ok(Arc::new(MemoryConnector::new())),
        #[cfg(feature = "redb")]
        BackendConfig::Redb { path } => Ok(Arc::new(
            crate::storage::backends::RedbConnector::new(path.clone()),
        )),
        #[cfg(not(feature = "redb"))]
        BackendConfig::Redb { .. } => Err(DatastoreError::Config(
            "redb backend requires the `redb` feature".to_string(),
        )),
        #[cfg(feature = "postgres")]
        BackendConfig::Postgres { url } => Ok(Arc::new(
            crate::storage::backends::PostgresConnector::new(url.clone()),
        )),
        #[cfg(not(feature = "postgres"))]
        BackendConfig::Postgres { .. } => Err(DatastoreError::Config(
            "postgres backend requires the `postgres` feature".to_string(),
        )),
    }
}

/// Builds fully-wired [`Datastore`] instances.
pub struct DatastoreFactory {
    config: DatastoreConfig,
    observers: Vec<Arc<dyn UsageObserver>>,
    clock: Arc<dyn ClockSource>,
}

impl DatastoreFactory {
    #[must_use]
    pub fn new(config: DatastoreConfig, observers: Vec<Arc<dyn UsageObserver>>) -> Self {
        Self {
            config,
            observers,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock used for expiration decisions.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Connects and returns the datastore with its quota tracker.
    ///
    /// # Errors
    ///
    /// Returns [`DatastoreError::Config`] for an unavailable backend kind and
    /// [`DatastoreError::Storage`] if the backend cannot be reached.
    pub async fn open(&self) -> Result<(Datastore, Arc<QuotaTracker>), DatastoreError> {
        let connector = connector_for(&self.config.backend)?;
        let mut session = Session::open(connector, self.config.retry_policy()).await?;
        let stored = session.payload().await?;

        let tracker = Arc::new(QuotaTracker::new(self.config.quota_bytes, stored));
        let mut usage = CompositeUsageObserver::new(self.observers.clone());
        usage.add(Arc::clone(&tracker) as Arc<dyn UsageObserver>);

        info!(
            target = %session.target(),
            stored,
            quota = self.config.quota_bytes,
            "datastore opened"
        );
        let datastore = Datastore::new(session, Arc::new(usage), Arc::clone(&self.clock));
        Ok((datastore, tracker))
    }
}
