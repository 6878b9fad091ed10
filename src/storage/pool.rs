use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::bucket::BucketDb;
use crate::error::{CacheError, CacheResult};
use crate::metrics;
use crate::record::{self, Record};

static DEFAULT_POOL: OnceCell<Arc<Pool>> = OnceCell::new();

/// Registry of open bucket handles for one proxy instance.
///
/// Every bucket has at most one handle for the lifetime of the pool. In
/// session mode the pool also remembers every key read or written, so that
/// teardown can prune records the run never touched. Once closed, the pool
/// refuses to open handles again.
#[derive(Debug)]
pub struct Pool {
    store_dir: PathBuf,
    session_mode: bool,
    handles: RwLock<HashMap<String, Arc<BucketDb>>>,
    requested: Mutex<HashSet<String>>,
    schemas_created: AtomicUsize,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(store_dir: impl Into<PathBuf>, session_mode: bool) -> Self {
        Self {
            store_dir: store_dir.into(),
            session_mode,
            handles: RwLock::new(HashMap::new()),
            requested: Mutex::new(HashSet::new()),
            schemas_created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn session_mode(&self) -> bool {
        self.session_mode
    }

    /// Number of bucket files whose schema this pool created.
    pub fn schemas_created(&self) -> usize {
        self.schemas_created.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn get_or_create(&self, bucket: &str) -> CacheResult<Arc<BucketDb>> {
        if let Some(handle) = self.handles.read().get(bucket) {
            return Ok(handle.clone());
        }

        let mut handles = self.handles.write();
        if let Some(handle) = handles.get(bucket) {
            return Ok(handle.clone());
        }
        // Checked under the write lock so a concurrent close cannot be missed.
        if self.is_closed() {
            return Err(CacheError::PoolClosed(self.store_dir.display().to_string()));
        }
        let path = bucket_file(&self.store_dir, bucket);
        let (db, created) = BucketDb::open_or_create(&path)?;
        if created {
            self.schemas_created.fetch_add(1, Ordering::SeqCst);
        }
        let handle = Arc::new(db);
        handles.insert(bucket.to_string(), handle.clone());
        metrics::inc_open_handles();
        debug!(bucket, path = %path.display(), created, "opened bucket handle");
        Ok(handle)
    }

    pub fn upsert(&self, bucket: &str, key: &str, record: &Record) -> CacheResult<()> {
        let payload = record::encode(record)?;
        self.upsert_raw(bucket, key, &payload)
    }

    pub fn select(&self, bucket: &str, key: &str) -> CacheResult<Option<Record>> {
        self.select_raw(bucket, key)?
            .map(|payload| record::decode(&payload, false))
            .transpose()
    }

    /// Stores an already encoded record. Identical content is not rewritten.
    pub fn upsert_raw(&self, bucket: &str, key: &str, payload: &[u8]) -> CacheResult<()> {
        self.remember(key);
        let handle = self.get_or_create(bucket)?;
        let written = handle.upsert(key, payload)?;
        if !written {
            debug!(bucket, key, "record unchanged; write skipped");
        }
        Ok(())
    }

    pub fn select_raw(&self, bucket: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.remember(key);
        self.get_or_create(bucket)?.select(key)
    }

    fn remember(&self, key: &str) {
        if self.session_mode {
            self.requested.lock().insert(key.to_string());
        }
    }

    /// Deletes every record in the open buckets that was not requested
    /// during this session. Returns 0 outside session mode.
    pub fn delete_old(&self) -> CacheResult<usize> {
        if !self.session_mode {
            return Ok(0);
        }
        let keep = self.requested.lock().clone();
        let handles: Vec<(String, Arc<BucketDb>)> = self
            .handles
            .read()
            .iter()
            .map(|(bucket, handle)| (bucket.clone(), handle.clone()))
            .collect();

        let mut total = 0usize;
        for (bucket, handle) in handles {
            let deleted = handle.delete_except(&keep)?;
            if deleted > 0 {
                info!(bucket = %bucket, deleted, "session cleanup removed stale records");
            }
            total += deleted;
        }
        metrics::record_session_gc(total);
        Ok(total)
    }

    /// Closes every handle and clears the registry. Safe to call repeatedly;
    /// later lookups fail with [`CacheError::PoolClosed`].
    pub fn close(&self) -> CacheResult<()> {
        let drained: Vec<(String, Arc<BucketDb>)> = {
            let mut handles = self.handles.write();
            self.closed.store(true, Ordering::SeqCst);
            handles.drain().collect()
        };
        metrics::dec_open_handles(drained.len());
        let mut first_err = None;
        for (bucket, handle) in drained {
            if let Err(err) = handle.close() {
                warn!(bucket = %bucket, error = %err, "failed to close bucket handle");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs session cleanup, then closes all handles even if cleanup failed.
    pub fn shutdown(&self) -> usize {
        let deleted = match self.delete_old() {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!(error = %err, "session cleanup failed");
                0
            }
        };
        if let Err(err) = self.close() {
            warn!(error = %err, "closing bucket handles failed");
        }
        deleted
    }
}

/// Process-wide pool rooted at `store_dir`. Only the first call's arguments
/// take effect.
pub fn default_pool(store_dir: impl Into<PathBuf>, session_mode: bool) -> Arc<Pool> {
    DEFAULT_POOL
        .get_or_init(|| Arc::new(Pool::new(store_dir, session_mode)))
        .clone()
}

/// Physical file of a bucket. A `.db` suffix is never doubled.
pub fn bucket_file(store_dir: &Path, bucket: &str) -> PathBuf {
    if bucket.ends_with(".db") {
        store_dir.join(bucket)
    } else {
        store_dir.join(format!("{bucket}.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use http::{HeaderMap, StatusCode};
    use tempfile::TempDir;

    fn record(body: &[u8]) -> Record {
        Record::new(
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
            body.to_vec(),
            HeaderMap::new(),
            StatusCode::OK,
        )
    }

    #[test]
    fn bucket_file_appends_suffix_once() {
        let dir = Path::new("/data");
        assert_eq!(bucket_file(dir, "beer"), PathBuf::from("/data/beer.db"));
        assert_eq!(bucket_file(dir, "my.db"), PathBuf::from("/data/my.db"));
    }

    #[test]
    fn concurrent_first_access_creates_one_handle() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = Arc::new(Pool::new(dir.path(), false));
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    pool.get_or_create("shared").unwrap()
                })
            })
            .collect();
        let dbs: Vec<Arc<BucketDb>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(pool.schemas_created(), 1);
        assert_eq!(pool.open_handles(), 1);
        assert!(dbs.iter().all(|db| Arc::ptr_eq(db, &dbs[0])));
        pool.close()?;
        Ok(())
    }

    #[test]
    fn select_round_trips_records() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = Pool::new(dir.path(), false);
        assert!(pool.select("beer", "k")?.is_none());
        pool.upsert("beer", "k", &record(b"stout"))?;
        let found = pool.select("beer", "k")?.expect("stored record");
        assert_eq!(found.response_body, b"stout");
        assert!(dir.path().join("beer.db").exists());
        Ok(())
    }

    #[test]
    fn session_cleanup_removes_unrequested_keys() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let seed = Pool::new(dir.path(), false);
        for key in ["A", "B", "C"] {
            seed.upsert("bucket", key, &record(key.as_bytes()))?;
        }
        assert_eq!(seed.delete_old()?, 0, "cleanup is a no-op outside session mode");
        seed.close()?;

        let session = Pool::new(dir.path(), true);
        assert!(session.select("bucket", "A")?.is_some());
        session.upsert("bucket", "B", &record(b"B2"))?;
        assert_eq!(session.delete_old()?, 1);

        let mut ids = session.get_or_create("bucket")?.ids()?;
        ids.sort();
        assert_eq!(ids, vec!["A", "B"]);
        session.close()?;
        Ok(())
    }

    #[test]
    fn close_is_idempotent_and_refuses_new_handles() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let pool = Pool::new(dir.path(), false);
        let first = pool.get_or_create("b")?;
        pool.close()?;
        pool.close()?;
        assert!(first.is_closed());
        assert!(pool.is_closed());
        assert_eq!(pool.open_handles(), 0);

        let err = pool.upsert("b", "k", &record(b"x")).unwrap_err();
        assert!(matches!(err, CacheError::PoolClosed(_)), "{err}");
        assert!(pool.select_raw("other", "k").is_err());
        assert_eq!(pool.open_handles(), 0);
        Ok(())
    }

    #[test]
    fn shutdown_prunes_then_closes() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let seed = Pool::new(dir.path(), false);
        seed.upsert("b", "old", &record(b"old"))?;
        seed.close()?;

        let pool = Pool::new(dir.path(), true);
        pool.upsert("b", "new", &record(b"new"))?;
        assert_eq!(pool.shutdown(), 1);
        assert_eq!(pool.open_handles(), 0);
        assert!(pool.upsert("b", "late", &record(b"late")).is_err());

        let db = BucketDb::open_existing(&dir.path().join("b.db"))?;
        assert_eq!(db.ids()?, vec!["new"]);
        db.close()?;
        Ok(())
    }

    #[test]
    fn default_pool_is_shared() {
        let a = default_pool(std::env::temp_dir(), false);
        let b = default_pool("/elsewhere", true);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
