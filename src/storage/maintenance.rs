use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};
use walkdir::WalkDir;

use super::bucket::BucketDb;
use crate::error::{CacheError, CacheResult};

/// Deletes records last written before `before_unix_secs` from every `*.db`
/// bucket file under `dir`. Returns the number of deleted rows per file.
pub fn clean_dir_by_time(dir: &Path, before_unix_secs: i64) -> CacheResult<BTreeMap<PathBuf, usize>> {
    if !dir.is_dir() {
        return Err(CacheError::io(
            format!("cleaning {}", dir.display()),
            std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
        ));
    }

    let mut report = BTreeMap::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                continue;
            }
        };
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().is_none_or(|ext| ext != "db") {
            continue;
        }

        let db = BucketDb::open_existing(path)?;
        let deleted = db.delete_older_than(before_unix_secs);
        db.close()?;
        let deleted = deleted?;
        info!(path = %path.display(), deleted, "cleaned bucket file");
        report.insert(path.to_path_buf(), deleted);
    }
    Ok(report)
}
