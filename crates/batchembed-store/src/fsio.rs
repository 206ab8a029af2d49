//! Atomic file placement: write into a staging directory on the same
//! filesystem, fsync, rename over the final name, fsync the directory.
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

pub const STAGING_DIR: &str = ".tmp";
const STAGING_SUFFIX: &str = ".tmp";

pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}

pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| StoreError::io(dir, e))?;
        handle.sync_all().map_err(|e| StoreError::io(dir, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

fn staging_path(staging: &Path, final_name: &str) -> PathBuf {
    let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
    staging.join(format!("{final_name}.{}.{seq}{STAGING_SUFFIX}", std::process::id()))
}

/// Write `dest` through a staged temporary. `write` receives the open file
/// and must flush everything it buffers before returning.
///
/// On any error the temporary is removed and `dest` is left untouched.
pub fn write_atomic<T>(staging: &Path, dest: &Path, write: impl FnOnce(File) -> Result<T>) -> Result<T> {
    ensure_dir(staging)?;
    let name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| StoreError::invalid(dest, "destination has no file name"))?;
    let tmp = staging_path(staging, name);
    let result = (|| -> Result<T> {
        let file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
        let sync_handle = file.try_clone().map_err(|e| StoreError::io(&tmp, e))?;
        let out = write(file)?;
        sync_handle.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, dest).map_err(|e| StoreError::io(dest, e))?;
        Ok(out)
    })();
    match result {
        Ok(out) => {
            if let Some(parent) = dest.parent() {
                sync_dir(parent)?;
            }
            debug!(path = %dest.display(), "file placed");
            Ok(out)
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

pub fn write_json_atomic<T: Serialize>(staging: &Path, dest: &Path, value: &T) -> Result<()> {
    write_atomic(staging, dest, |mut file| {
        serde_json::to_writer_pretty(&mut file, value)?;
        file.write_all(b"\n").map_err(|e| StoreError::io(dest, e))?;
        file.flush().map_err(|e| StoreError::io(dest, e))
    })
}

/// Remove temporaries left behind by an interrupted writer. Returns how many
/// were removed.
pub fn cleanup_staging(staging: &Path) -> Result<usize> {
    let entries = match fs::read_dir(staging) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StoreError::io(staging, e)),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(staging, e))?;
        let path = entry.path();
        let is_tmp = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(STAGING_SUFFIX));
        if is_tmp && path.is_file() {
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
            removed += 1;
        }
    }
    if removed > 0 {
        warn!(dir = %staging.display(), removed, "removed stale staging files");
    }
    Ok(removed)
}
