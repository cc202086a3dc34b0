use std::fmt;
use std::sync::Arc;

use logsentry_auth::KeyHasher;
use logsentry_config::Config;
use logsentry_metrics::SnapshotRegistry;
use logsentry_system::{Addr, Service};

use crate::services::classifier::{ClassifierHandle, HttpClassifier};
use crate::services::device_auth::{DeviceAuth, DeviceAuthService};
use crate::services::health_check::{HealthCheck, HealthCheckService};
use crate::services::key_cache::{KeyCache, KeyCacheService};
use crate::services::processor::{ProcessorPool, ProcessorPoolService};
use crate::services::spool::{DiskSpool, SpoolError};
use crate::store::{SqliteStore, Store, StoreError};

/// An error raised when starting the service state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Connecting to the document store failed.
    #[error("could not open the document store")]
    Store(#[from] StoreError),

    /// Opening the disk spool failed.
    #[error("could not open the disk spool")]
    Spool(#[from] SpoolError),
}

/// Addresses of all running services.
#[derive(Clone)]
pub struct Registry {
    processor_pool: Addr<ProcessorPool>,
    key_cache: Addr<KeyCache>,
    device_auth: Addr<DeviceAuth>,
    health_check: Addr<HealthCheck>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

struct StateInner {
    config: Arc<Config>,
    registry: Registry,
    store: Arc<dyn Store>,
    snapshots: Arc<SnapshotRegistry>,
}

/// Server state shared by all endpoints.
///
/// The process-wide runtime described in the design notes: the key cache,
/// the processor registry and the snapshot map all hang off this handle, so
/// tests can create an isolated instance instead of relying on ambient
/// singletons.
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

impl ServiceState {
    /// Starts all services against the configured SQLite store.
    pub async fn start(config: Arc<Config>) -> Result<Self, StateError> {
        let store = Arc::new(SqliteStore::connect(config.store_url()).await?);
        Self::start_with_store(config, store).await
    }

    /// Starts all services against the given store.
    ///
    /// Tests use this with a [`MemoryStore`](crate::store::MemoryStore).
    pub async fn start_with_store(
        config: Arc<Config>,
        store: Arc<dyn Store>,
    ) -> Result<Self, StateError> {
        let spool = DiskSpool::open(config.spool_path(), config.spool_max_bytes()).await?;
        let hasher = Arc::new(KeyHasher::new(config.key_pepper()));
        let snapshots = Arc::new(SnapshotRegistry::new());

        let classifier = config.classifier_url().map(|url| {
            ClassifierHandle::new(
                Arc::new(HttpClassifier::new(url)),
                config.classifier_concurrency(),
                config.classifier_timeout(),
            )
        });

        let key_cache = KeyCacheService::new(
            store.clone(),
            hasher.clone(),
            config.negative_cache_ttl(),
        )
        .start();

        let device_auth = DeviceAuthService::new(
            config.clone(),
            store.clone(),
            hasher,
            key_cache.clone().recipient(),
        )
        .start();

        let processor_pool = ProcessorPoolService::new(
            config.clone(),
            store.clone(),
            spool,
            classifier,
            snapshots.clone(),
        )
        .start();

        let health_check = HealthCheckService::new(store.clone()).start();

        let registry = Registry {
            processor_pool,
            key_cache,
            device_auth,
            health_check,
        };

        Ok(Self {
            inner: Arc::new(StateInner {
                config,
                registry,
                store,
                snapshots,
            }),
        })
    }

    /// Returns the server configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Returns the document store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Returns the published aggregate snapshots.
    pub fn snapshots(&self) -> &Arc<SnapshotRegistry> {
        &self.inner.snapshots
    }

    /// Returns the address of the processor pool.
    pub fn processor_pool(&self) -> &Addr<ProcessorPool> {
        &self.inner.registry.processor_pool
    }

    /// Returns the address of the API key cache.
    pub fn key_cache(&self) -> &Addr<KeyCache> {
        &self.inner.registry.key_cache
    }

    /// Returns the address of the device-authorization service.
    pub fn device_auth(&self) -> &Addr<DeviceAuth> {
        &self.inner.registry.device_auth
    }

    /// Returns the address of the health check service.
    pub fn health_check(&self) -> &Addr<HealthCheck> {
        &self.inner.registry.health_check
    }
}

impl fmt::Debug for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceState")
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}
