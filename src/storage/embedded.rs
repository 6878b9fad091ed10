use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use super::StoredRow;
use super::pool::Pool;
use crate::error::{CacheError, CacheResult};

const BACKEND: &str = "embedded";

/// One SQLite file per bucket, reached through a [`Pool`].
#[derive(Debug)]
pub struct EmbeddedStore {
    pool: Arc<Pool>,
    verbose: AtomicBool,
}

impl EmbeddedStore {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            verbose: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn read(&self, bucket: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let found = self.pool.select_raw(bucket, key)?;
        self.trace("read", bucket, key, found.is_some());
        Ok(found)
    }

    pub fn save(&self, bucket: &str, key: &str, bytes: &[u8]) -> CacheResult<()> {
        self.pool.upsert_raw(bucket, key, bytes)?;
        self.trace("save", bucket, key, true);
        Ok(())
    }

    pub fn set_version(&self, _version: &str) -> CacheResult<()> {
        Err(CacheError::unsupported(BACKEND, "set_version"))
    }

    pub fn preload_by_version(&self) -> CacheResult<usize> {
        Err(CacheError::unsupported(BACKEND, "preload_by_version"))
    }

    pub fn verbose_mode(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    pub fn read_all(&self, bucket: &str) -> CacheResult<Vec<StoredRow>> {
        self.pool.get_or_create(bucket)?.select_all()
    }

    fn trace(&self, op: &str, bucket: &str, key: &str, found: bool) {
        if self.verbose.load(Ordering::Relaxed) {
            info!(backend = BACKEND, op, bucket, key, found, "storage access");
        } else {
            debug!(backend = BACKEND, op, bucket, key, found, "storage access");
        }
    }
}
