//! Record persistence.
//!
//! [`StorageBackend`] is the contract the proxy handler talks to. The
//! embedded variant keeps one SQLite file per bucket behind a [`pool::Pool`];
//! the shared variant keeps every bucket in one versioned table.

pub mod bucket;
pub mod diff;
pub mod embedded;
pub mod maintenance;
pub mod pool;
pub mod shared;

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CacheError, CacheResult};
use crate::settings::{BackendKind, Settings};

pub use embedded::EmbeddedStore;
pub use pool::Pool;
pub use shared::{SharedConfig, SharedStore};

/// One persisted row as seen by bulk readers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredRow {
    pub id: String,
    pub last_date: i64,
    #[serde(skip)]
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum StorageBackend {
    Embedded(EmbeddedStore),
    Shared(SharedStore),
}

impl StorageBackend {
    /// Builds the backend selected by `settings`. An embedded backend gets its
    /// own pool, released by [`StorageBackend::shutdown`].
    pub fn from_settings(settings: &Settings) -> CacheResult<Self> {
        let backend = match settings.backend {
            BackendKind::Embedded => {
                let pool = Arc::new(Pool::new(&settings.store_path, settings.session_mode));
                StorageBackend::Embedded(EmbeddedStore::new(pool))
            }
            BackendKind::Shared => {
                let config = settings.shared.clone().ok_or_else(|| {
                    CacheError::Config("backend = \"shared\" requires a [shared] section".into())
                })?;
                let store = SharedStore::open(config)?;
                store.preload_by_version()?;
                StorageBackend::Shared(store)
            }
        };
        backend.verbose_mode(settings.verbose);
        info!(backend = backend.name(), "storage backend ready");
        Ok(backend)
    }

    /// Runs session cleanup and closes the embedded pool. Call once no request
    /// can reach the backend any more. Returns the number of pruned records.
    pub async fn shutdown(&self) -> usize {
        let Some(pool) = self.pool().cloned() else {
            return 0;
        };
        tokio::task::spawn_blocking(move || pool.shutdown())
            .await
            .unwrap_or_else(|err| {
                warn!(error = %err, "storage teardown task failed");
                0
            })
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Embedded(_) => "embedded",
            StorageBackend::Shared(_) => "shared",
        }
    }

    pub fn read(&self, bucket: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match self {
            StorageBackend::Embedded(store) => store.read(bucket, key),
            StorageBackend::Shared(store) => store.read(bucket, key),
        }
    }

    pub fn save(&self, bucket: &str, key: &str, bytes: &[u8]) -> CacheResult<()> {
        match self {
            StorageBackend::Embedded(store) => store.save(bucket, key, bytes),
            StorageBackend::Shared(store) => store.save(bucket, key, bytes),
        }
    }

    pub fn set_version(&self, version: &str) -> CacheResult<()> {
        match self {
            StorageBackend::Embedded(store) => store.set_version(version),
            StorageBackend::Shared(store) => {
                store.set_version(version);
                Ok(())
            }
        }
    }

    pub fn preload_by_version(&self) -> CacheResult<()> {
        match self {
            StorageBackend::Embedded(store) => store.preload_by_version().map(drop),
            StorageBackend::Shared(store) => store.preload_by_version().map(drop),
        }
    }

    pub fn verbose_mode(&self, verbose: bool) {
        match self {
            StorageBackend::Embedded(store) => store.verbose_mode(verbose),
            StorageBackend::Shared(store) => store.verbose_mode(verbose),
        }
    }

    pub fn read_all(&self, bucket: &str) -> CacheResult<Vec<StoredRow>> {
        match self {
            StorageBackend::Embedded(store) => store.read_all(bucket),
            StorageBackend::Shared(store) => store.read_all(bucket),
        }
    }

    pub fn pool(&self) -> Option<&Arc<Pool>> {
        match self {
            StorageBackend::Embedded(store) => Some(store.pool()),
            StorageBackend::Shared(_) => None,
        }
    }
}
