use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use tracing::debug;

use super::StoredRow;
use crate::error::{CacheError, CacheResult};
use crate::record::content_hash;

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS main (
    id TEXT PRIMARY KEY,
    last_date INTEGER NOT NULL,
    hash TEXT NOT NULL,
    body BLOB NOT NULL
)";
const CREATE_INDEX_SQL: &str = "CREATE INDEX IF NOT EXISTS idx_last_date ON main (last_date)";
const UPSERT_SQL: &str = "INSERT INTO main (id, last_date, hash, body) VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT(id) DO UPDATE SET
        body = excluded.body,
        hash = excluded.hash,
        last_date = excluded.last_date
    WHERE main.hash IS NOT excluded.hash";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One open SQLite file holding every record of a single bucket.
#[derive(Debug)]
pub struct BucketDb {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl BucketDb {
    /// Opens the bucket file, creating the file and its schema when missing.
    /// The flag reports whether the schema had to be created.
    pub fn open_or_create(path: &Path) -> CacheResult<(Self, bool)> {
        let exists = path.exists();
        if !exists && let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                CacheError::io(format!("creating store directory {}", parent.display()), err)
            })?;
        }
        let conn = open_connection(path, true)?;
        if !exists {
            create_schema(&conn)?;
            debug!(path = %path.display(), "created bucket schema");
        }
        Ok((Self::from_connection(path, conn), !exists))
    }

    /// Opens an existing bucket file without creating anything.
    pub fn open_existing(path: &Path) -> CacheResult<Self> {
        if !path.exists() {
            return Err(CacheError::io(
                format!("opening bucket {}", path.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "bucket file does not exist"),
            ));
        }
        let conn = open_connection(path, false)?;
        Ok(Self::from_connection(path, conn))
    }

    fn from_connection(path: &Path, conn: Connection) -> Self {
        Self {
            path: path.to_path_buf(),
            conn: Mutex::new(Some(conn)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or replaces the record body. Returns false when the stored
    /// body already carries the same content hash and nothing was written.
    pub fn upsert(&self, id: &str, body: &[u8]) -> CacheResult<bool> {
        let hash = content_hash(body);
        let changed = self.with_conn(|conn| {
            conn.execute(UPSERT_SQL, params![id, unix_now(), hash, body])
                .map_err(CacheError::from)
        })?;
        Ok(changed > 0)
    }

    pub fn select(&self, id: &str) -> CacheResult<Option<Vec<u8>>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT body FROM main WHERE id = ?1", params![id], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()
            .map_err(CacheError::from)
        })
    }

    pub fn select_all(&self) -> CacheResult<Vec<StoredRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, last_date, body FROM main ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(StoredRow {
                        id: row.get(0)?,
                        last_date: row.get(1)?,
                        body: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn ids(&self) -> CacheResult<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM main")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }

    /// Deletes every row whose id is not in `keep`, in one transaction.
    pub fn delete_except(&self, keep: &HashSet<String>) -> CacheResult<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let stale: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM main")?;
                stmt.query_map([], |row| row.get::<_, String>(0))?
                    .filter(|id| id.as_ref().map(|id| !keep.contains(id)).unwrap_or(true))
                    .collect::<Result<Vec<_>, _>>()?
            };
            let mut deleted = 0usize;
            {
                let mut stmt = tx.prepare("DELETE FROM main WHERE id = ?1")?;
                for id in &stale {
                    deleted += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
    }

    pub fn delete_older_than(&self, before_unix_secs: i64) -> CacheResult<usize> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM main WHERE last_date < ?1",
                params![before_unix_secs],
            )
            .map_err(CacheError::from)
        })
    }

    /// Closes the connection. Later calls are no-ops.
    pub fn close(&self) -> CacheResult<()> {
        let conn = self.conn.lock().take();
        match conn {
            Some(conn) => conn.close().map_err(|(_, err)| CacheError::from(err)),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().is_none()
    }

    fn with_conn<T>(&self, op: impl FnOnce(&mut Connection) -> CacheResult<T>) -> CacheResult<T> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().ok_or_else(|| {
            CacheError::io(
                format!("using bucket {}", self.path.display()),
                std::io::Error::new(std::io::ErrorKind::NotConnected, "bucket handle is closed"),
            )
        })?;
        op(conn)
    }
}

fn open_connection(path: &Path, create: bool) -> CacheResult<Connection> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> CacheResult<()> {
    conn.execute_batch(&format!(
        "BEGIN; {CREATE_TABLE_SQL}; {CREATE_INDEX_SQL}; COMMIT;"
    ))?;
    Ok(())
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or_default()
}
