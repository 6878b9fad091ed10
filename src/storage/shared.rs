//! Versioned storage in one shared database.
//!
//! All buckets live in a single table keyed by `(bucket, key, version)`, so
//! several record series (for example one per branch) can coexist. An
//! optional in-memory cache avoids re-reading and re-writing unchanged rows.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Deserialize;
use tracing::{debug, info};

use super::StoredRow;
use super::bucket::unix_now;
use crate::error::{CacheError, CacheResult};
use crate::record::content_hash;

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static identifier regex"));

const SHORT_BUCKET_LEN: usize = 32;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SharedConfig {
    pub path: PathBuf,
    pub table: String,
    pub bucket_column: String,
    pub key_column: String,
    pub value_column: String,
    pub version_column: String,
    /// Record series for the current run. Empty when versions are unused.
    pub version: String,
    pub use_cache: bool,
    /// Load the whole active version into the cache at startup.
    pub use_preload: bool,
    /// Store bucket names verbatim instead of a fixed-width digest.
    pub human_readable_bucket: bool,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cacheproxy.sqlite"),
            table: "dbfiles".to_string(),
            bucket_column: "file_name".to_string(),
            key_column: "key".to_string(),
            value_column: "data".to_string(),
            version_column: "version".to_string(),
            version: String::new(),
            use_cache: false,
            use_preload: false,
            human_readable_bucket: false,
        }
    }
}

impl SharedConfig {
    pub fn validate(&self) -> CacheResult<()> {
        for (field, value) in [
            ("table", &self.table),
            ("bucket_column", &self.bucket_column),
            ("key_column", &self.key_column),
            ("value_column", &self.value_column),
            ("version_column", &self.version_column),
        ] {
            if !IDENTIFIER.is_match(value) {
                return Err(CacheError::Config(format!(
                    "shared.{field} must be a plain SQL identifier, got '{value}'"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheSlot {
    bucket: String,
    key: String,
    version: String,
}

#[derive(Debug, Clone)]
struct CachedValue {
    hash: String,
    bytes: Vec<u8>,
}

struct Statements {
    select: String,
    upsert: String,
    preload: String,
    select_bucket: String,
}

impl Statements {
    fn new(cfg: &SharedConfig) -> Self {
        let SharedConfig {
            table,
            bucket_column: bucket,
            key_column: key,
            value_column: value,
            version_column: version,
            ..
        } = cfg;
        Self {
            select: format!(
                "SELECT {value} FROM {table} WHERE {bucket} = ?1 AND {key} = ?2 AND {version} = ?3"
            ),
            upsert: format!(
                "INSERT INTO {table} ({bucket}, {key}, {version}, {value}, content_hash, last_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT ({bucket}, {key}, {version}) DO UPDATE SET
                     {value} = excluded.{value},
                     content_hash = excluded.content_hash,
                     last_date = excluded.last_date
                 WHERE {table}.content_hash IS NOT excluded.content_hash"
            ),
            preload: format!(
                "SELECT {bucket}, {key}, {value}, content_hash FROM {table} WHERE {version} = ?1"
            ),
            select_bucket: format!(
                "SELECT {key}, last_date, {value} FROM {table}
                 WHERE {bucket} = ?1 AND {version} = ?2 ORDER BY {key}"
            ),
        }
    }

    fn create_table(cfg: &SharedConfig) -> String {
        let SharedConfig {
            table,
            bucket_column: bucket,
            key_column: key,
            value_column: value,
            version_column: version,
            ..
        } = cfg;
        format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                {bucket} TEXT NOT NULL,
                {key} TEXT NOT NULL,
                {version} TEXT NOT NULL,
                {value} BLOB,
                content_hash TEXT,
                last_date INTEGER NOT NULL DEFAULT 0,
                UNIQUE ({bucket}, {key}, {version})
            )"
        )
    }
}

pub struct SharedStore {
    config: SharedConfig,
    statements: Statements,
    conn: Mutex<Connection>,
    version: RwLock<String>,
    cache: RwLock<HashMap<CacheSlot, CachedValue>>,
    verbose: AtomicBool,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("path", &self.config.path)
            .field("table", &self.config.table)
            .field("version", &*self.version.read())
            .finish_non_exhaustive()
    }
}

impl SharedStore {
    pub fn open(config: SharedConfig) -> CacheResult<Self> {
        config.validate()?;
        if let Some(parent) = config.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                CacheError::io(format!("creating directory {}", parent.display()), err)
            })?;
        }
        let conn = Connection::open(&config.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(&Statements::create_table(&config))?;

        Ok(Self {
            statements: Statements::new(&config),
            version: RwLock::new(config.version.clone()),
            config,
            conn: Mutex::new(conn),
            cache: RwLock::new(HashMap::new()),
            verbose: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn version(&self) -> String {
        self.version.read().clone()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().len()
    }

    pub fn verbose_mode(&self, verbose: bool) {
        self.verbose.store(verbose, Ordering::Relaxed);
    }

    fn stored_bucket(&self, bucket: &str) -> String {
        if self.config.human_readable_bucket {
            return bucket.to_string();
        }
        let digest = blake3::hash(bucket.as_bytes()).to_hex();
        digest.as_str()[..SHORT_BUCKET_LEN].to_string()
    }

    fn slot(&self, bucket: String, key: &str) -> CacheSlot {
        CacheSlot {
            bucket,
            key: key.to_string(),
            version: self.version(),
        }
    }

    pub fn read(&self, bucket: &str, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let slot = self.slot(self.stored_bucket(bucket), key);
        if self.config.use_cache
            && let Some(cached) = self.cache.read().get(&slot)
        {
            self.trace("cache read", bucket, key);
            return Ok(Some(cached.bytes.clone()));
        }

        let found: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                &self.statements.select,
                params![slot.bucket, slot.key, slot.version],
                |row| row.get(0),
            )
            .optional()?;
        self.trace("read", bucket, key);

        if self.config.use_cache
            && let Some(bytes) = &found
        {
            let hash = content_hash(bytes);
            self.cache.write().insert(
                slot,
                CachedValue {
                    hash,
                    bytes: bytes.clone(),
                },
            );
        }
        Ok(found)
    }

    pub fn save(&self, bucket: &str, key: &str, bytes: &[u8]) -> CacheResult<()> {
        let slot = self.slot(self.stored_bucket(bucket), key);
        let hash = content_hash(bytes);
        if self.config.use_cache
            && self
                .cache
                .read()
                .get(&slot)
                .is_some_and(|cached| cached.hash == hash)
        {
            self.trace("save skipped (cached)", bucket, key);
            return Ok(());
        }

        self.conn.lock().execute(
            &self.statements.upsert,
            params![slot.bucket, slot.key, slot.version, bytes, hash, unix_now()],
        )?;
        self.trace("save", bucket, key);

        if self.config.use_cache {
            self.cache.write().insert(
                slot,
                CachedValue {
                    hash,
                    bytes: bytes.to_vec(),
                },
            );
        }
        Ok(())
    }

    pub fn set_version(&self, version: &str) {
        *self.version.write() = version.to_string();
        info!(version, "shared store version changed");
    }

    /// Loads every row of the active version into the cache.
    /// No-op unless both caching and preloading are enabled.
    pub fn preload_by_version(&self) -> CacheResult<usize> {
        if !self.config.use_cache || !self.config.use_preload {
            return Ok(0);
        }
        let version = self.version();
        let rows: Vec<(String, String, Vec<u8>, Option<String>)> = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&self.statements.preload)?;
            stmt.query_map(params![version], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };

        let mut cache = self.cache.write();
        let loaded = rows.len();
        for (bucket, key, bytes, hash) in rows {
            let hash = hash.unwrap_or_else(|| content_hash(&bytes));
            cache.insert(
                CacheSlot {
                    bucket,
                    key,
                    version: version.clone(),
                },
                CachedValue { hash, bytes },
            );
        }
        info!(version = %version, loaded, "preloaded shared store cache");
        Ok(loaded)
    }

    pub fn read_all(&self, bucket: &str) -> CacheResult<Vec<StoredRow>> {
        let stored = self.stored_bucket(bucket);
        let version = self.version();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&self.statements.select_bucket)?;
        let rows = stmt
            .query_map(params![stored, version], |row| {
                Ok(StoredRow {
                    id: row.get(0)?,
                    last_date: row.get(1)?,
                    body: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn trace(&self, op: &str, bucket: &str, key: &str) {
        if self.verbose.load(Ordering::Relaxed) {
            info!(backend = "shared", op, bucket, key, "storage access");
        } else {
            debug!(backend = "shared", op, bucket, key, "storage access");
        }
    }
}
