//! Comparison of two recorded bucket files.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use super::{EmbeddedStore, Pool, StorageBackend, StoredRow};
use crate::error::{CacheError, CacheResult};
use crate::record::content_hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// Same id, same body and same last write time.
    Equal,
    AOnly,
    BOnly,
    /// Same id, different content.
    Body,
    /// Same id and content, written at different times.
    LastDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffRecord {
    pub id: String,
    pub last_date: i64,
    pub hash: String,
}

impl From<&StoredRow> for DiffRecord {
    fn from(row: &StoredRow) -> Self {
        Self {
            id: row.id.clone(),
            last_date: row.last_date,
            hash: content_hash(&row.body),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub diff: DiffKind,
    pub records: Vec<DiffRecord>,
}

/// Compares every record of bucket file `path_a` with `path_b`.
///
/// Ids present in A come first in id order, followed by ids found only in B.
pub fn compare(path_a: &Path, path_b: &Path) -> CacheResult<Vec<Diff>> {
    let rows_a = read_file(path_a)?;
    let rows_b = read_file(path_b)?;

    let mut by_id: HashMap<&str, DiffRecord> = rows_b
        .iter()
        .map(|row| (row.id.as_str(), DiffRecord::from(row)))
        .collect();

    let mut out = Vec::with_capacity(rows_a.len().max(rows_b.len()));
    for row in &rows_a {
        let a = DiffRecord::from(row);
        let Some(b) = by_id.remove(row.id.as_str()) else {
            out.push(Diff {
                diff: DiffKind::AOnly,
                records: vec![a],
            });
            continue;
        };
        let diff = if a.hash != b.hash {
            DiffKind::Body
        } else if a.last_date != b.last_date {
            DiffKind::LastDate
        } else {
            DiffKind::Equal
        };
        out.push(Diff {
            diff,
            records: vec![a, b],
        });
    }

    for row in &rows_b {
        if let Some(b) = by_id.remove(row.id.as_str()) {
            out.push(Diff {
                diff: DiffKind::BOnly,
                records: vec![b],
            });
        }
    }
    Ok(out)
}

/// Bulk-reads one bucket file through an embedded backend rooted at its
/// directory.
fn read_file(path: &Path) -> CacheResult<Vec<StoredRow>> {
    if !path.is_file() {
        return Err(CacheError::io(
            format!("opening bucket {}", path.display()),
            io::Error::new(io::ErrorKind::NotFound, "bucket file does not exist"),
        ));
    }
    let bucket = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| name.ends_with(".db"))
        .ok_or_else(|| {
            CacheError::Config(format!("{} is not a .db bucket file", path.display()))
        })?;
    let store_dir = path.parent().unwrap_or_else(|| Path::new(""));

    let pool = Arc::new(Pool::new(store_dir, false));
    let backend = StorageBackend::Embedded(EmbeddedStore::new(pool.clone()));
    let rows = backend.read_all(bucket);
    pool.close()?;
    rows
}
