//! Append-only progress ledger.
//!
//! `progress.jsonl` holds one [`ProgressMarker`] per line and is the single
//! source of truth for which chunks are done. Every append is fsynced before
//! `mark_done` returns. `ledger.json` pins the run parameters that give chunk
//! ids their meaning.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use batchembed_core::types::{ChunkId, ProgressMarker};

use crate::error::{Result, StoreError};
use crate::fsio::{self, STAGING_DIR};

pub const PROGRESS_FILE: &str = "progress.jsonl";
pub const META_FILE: &str = "ledger.json";

/// Parameters that must not change between runs sharing a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub chunk_size: usize,
    pub model_id: String,
    pub dim: usize,
    /// File name of the input, without directories.
    pub input: String,
}

impl LedgerMeta {
    fn mismatches(&self, other: &LedgerMeta) -> Vec<String> {
        let mut out = Vec::new();
        if self.chunk_size != other.chunk_size {
            out.push(format!("chunk_size {} != {}", other.chunk_size, self.chunk_size));
        }
        if self.model_id != other.model_id {
            out.push(format!("model_id {} != {}", other.model_id, self.model_id));
        }
        if self.dim != other.dim {
            out.push(format!("dim {} != {}", other.dim, self.dim));
        }
        if self.input != other.input {
            out.push(format!("input {} != {}", other.input, self.input));
        }
        out
    }
}

pub struct ProgressLedger {
    dir: PathBuf,
    log: File,
    meta: LedgerMeta,
    markers: BTreeMap<ChunkId, ProgressMarker>,
}

impl std::fmt::Debug for ProgressLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressLedger")
            .field("dir", &self.dir)
            .field("meta", &self.meta)
            .field("done", &self.markers.len())
            .finish()
    }
}

impl ProgressLedger {
    /// Open or create the ledger in `dir`.
    ///
    /// The first open records `meta`; later opens must present identical
    /// parameters or fail with [`StoreError::InvalidConfig`].
    pub fn open(dir: &Path, meta: LedgerMeta) -> Result<Self> {
        fsio::ensure_dir(dir)?;
        let meta_path = dir.join(META_FILE);
        match read_meta(&meta_path)? {
            Some(stored) => {
                let diffs = stored.mismatches(&meta);
                if !diffs.is_empty() {
                    return Err(StoreError::InvalidConfig(format!(
                        "ledger in {} was created with different parameters: {}",
                        dir.display(),
                        diffs.join(", ")
                    )));
                }
            }
            None => fsio::write_json_atomic(&dir.join(STAGING_DIR), &meta_path, &meta)?,
        }
        Self::load(dir, meta)
    }

    /// Open a ledger that must already exist, taking its parameters as stored.
    pub fn open_existing(dir: &Path) -> Result<Self> {
        let meta_path = dir.join(META_FILE);
        let meta = read_meta(&meta_path)?.ok_or_else(|| {
            StoreError::io(&meta_path, std::io::Error::new(std::io::ErrorKind::NotFound, "no ledger metadata"))
        })?;
        Self::load(dir, meta)
    }

    fn load(dir: &Path, meta: LedgerMeta) -> Result<Self> {
        let path = dir.join(PROGRESS_FILE);
        let markers = recover_log(&path)?;
        let log = OpenOptions::new().create(true).append(true).open(&path).map_err(|e| StoreError::io(&path, e))?;
        info!(dir = %dir.display(), done = markers.len(), "progress ledger opened");
        Ok(Self { dir: dir.to_path_buf(), log, meta, markers })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &LedgerMeta {
        &self.meta
    }

    /// Durably record a completed chunk. Returns `false` if it was already
    /// done, in which case nothing is written.
    pub fn mark_done(&mut self, marker: ProgressMarker) -> Result<bool> {
        if self.markers.contains_key(&marker.chunk_id) {
            return Ok(false);
        }
        let path = self.dir.join(PROGRESS_FILE);
        let mut line = serde_json::to_vec(&marker)?;
        line.push(b'\n');
        self.log.write_all(&line).map_err(|e| StoreError::io(&path, e))?;
        self.log.sync_data().map_err(|e| StoreError::io(&path, e))?;
        self.markers.insert(marker.chunk_id, marker);
        Ok(true)
    }

    pub fn is_done(&self, chunk_id: ChunkId) -> bool {
        self.markers.contains_key(&chunk_id)
    }

    pub fn all_done_ids(&self) -> BTreeSet<ChunkId> {
        self.markers.keys().copied().collect()
    }

    pub fn markers(&self) -> impl Iterator<Item = &ProgressMarker> {
        self.markers.values()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn done_records(&self) -> u64 {
        self.markers.values().map(|m| m.records).sum()
    }

    /// Done chunks whose recorded shard is neither in `shard_dir` nor among
    /// the `consolidated` sources.
    pub fn check_integrity(&self, shard_dir: &Path, consolidated: &HashSet<String>) -> Vec<ChunkId> {
        self.markers
            .values()
            .filter(|m| !m.shard.is_empty() && !consolidated.contains(&m.shard))
            .filter(|m| !shard_dir.join(&m.shard).is_file())
            .map(|m| m.chunk_id)
            .collect()
    }
}

fn read_meta(path: &Path) -> Result<Option<LedgerMeta>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(path, e)),
    }
}

/// Parse the log, dropping a torn final line left by a crash mid-append.
///
/// A line that fails to parse anywhere but at the very end means the log was
/// damaged by something other than a crash, and is an integrity error.
fn recover_log(path: &Path) -> Result<BTreeMap<ChunkId, ProgressMarker>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    let mut markers = BTreeMap::new();
    let mut offset = 0usize;
    let mut valid_len = bytes.len();
    let mut lines = bytes.split(|b| *b == b'\n').peekable();
    let mut line_no = 0usize;
    while let Some(line) = lines.next() {
        line_no += 1;
        let is_last = lines.peek().is_none();
        let start = offset;
        offset += line.len() + 1;
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<ProgressMarker>(line) {
            Ok(marker) => {
                markers.entry(marker.chunk_id).or_insert(marker);
            }
            Err(e) if is_last => {
                warn!(path = %path.display(), line = line_no, error = %e, "discarding torn final ledger line");
                valid_len = start;
            }
            Err(e) => {
                return Err(StoreError::Integrity(format!(
                    "{} line {line_no} is corrupt: {e}",
                    path.display()
                )));
            }
        }
    }
    if valid_len < bytes.len() {
        let file = OpenOptions::new().write(true).open(path).map_err(|e| StoreError::io(path, e))?;
        file.set_len(valid_len as u64).map_err(|e| StoreError::io(path, e))?;
        file.sync_all().map_err(|e| StoreError::io(path, e))?;
    } else if !bytes.is_empty() && !bytes.ends_with(b"\n") {
        // Complete record missing only its newline.
        let mut file = OpenOptions::new().append(true).open(path).map_err(|e| StoreError::io(path, e))?;
        file.write_all(b"\n").map_err(|e| StoreError::io(path, e))?;
        file.sync_all().map_err(|e| StoreError::io(path, e))?;
    }
    Ok(markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> LedgerMeta {
        LedgerMeta { chunk_size: 10, model_id: "m".into(), dim: 3, input: "in.jsonl".into() }
    }

    #[test]
    fn marks_are_idempotent_and_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = ProgressLedger::open(tmp.path(), meta()).unwrap();
        assert!(ledger.mark_done(ProgressMarker::now(2, "shard-2", 10)).unwrap());
        assert!(!ledger.mark_done(ProgressMarker::now(2, "shard-2", 10)).unwrap());
        assert!(ledger.mark_done(ProgressMarker::now(0, "shard-0", 10)).unwrap());
        drop(ledger);

        let ledger = ProgressLedger::open(tmp.path(), meta()).unwrap();
        assert_eq!(ledger.all_done_ids(), BTreeSet::from([0, 2]));
        assert!(ledger.is_done(2));
        assert!(!ledger.is_done(1));
        let lines = fs::read_to_string(tmp.path().join(PROGRESS_FILE)).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[test]
    fn torn_tail_is_dropped_and_log_stays_appendable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ledger = ProgressLedger::open(tmp.path(), meta()).unwrap();
        ledger.mark_done(ProgressMarker::now(0, "s0", 1)).unwrap();
        drop(ledger);
        let path = tmp.path().join(PROGRESS_FILE);
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"chunk_id":1,"complet"#).unwrap();
        drop(f);

        let mut ledger = ProgressLedger::open(tmp.path(), meta()).unwrap();
        assert_eq!(ledger.all_done_ids(), BTreeSet::from([0]));
        ledger.mark_done(ProgressMarker::now(1, "s1", 1)).unwrap();
        drop(ledger);
        let ledger = ProgressLedger::open(tmp.path(), meta()).unwrap();
        assert_eq!(ledger.all_done_ids(), BTreeSet::from([0, 1]));
    }

    #[test]
    fn corrupt_middle_line_is_an_integrity_error() {
        let tmp = tempfile::tempdir().unwrap();
        ProgressLedger::open(tmp.path(), meta()).unwrap();
        let good = serde_json::to_string(&ProgressMarker::now(0, "s0", 1)).unwrap();
        fs::write(tmp.path().join(PROGRESS_FILE), format!("garbage\n{good}\n")).unwrap();
        let err = ProgressLedger::open(tmp.path(), meta()).unwrap_err();
        assert!(err.is_integrity(), "{err}");
    }

    #[test]
    fn changed_chunk_size_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        ProgressLedger::open(tmp.path(), meta()).unwrap();
        let other = LedgerMeta { chunk_size: 20, ..meta() };
        let err = ProgressLedger::open(tmp.path(), other).unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(ref m) if m.contains("chunk_size")));
        assert_eq!(ProgressLedger::open_existing(tmp.path()).unwrap().meta(), &meta());
    }

    #[test]
    fn missing_shards_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let shards = tmp.path().join("shards");
        fs::create_dir_all(&shards).unwrap();
        fs::write(shards.join("present.parquet"), b"x").unwrap();
        let mut ledger = ProgressLedger::open(&tmp.path().join("progress"), meta()).unwrap();
        ledger.mark_done(ProgressMarker::now(0, "present.parquet", 1)).unwrap();
        ledger.mark_done(ProgressMarker::now(1, "gone.parquet", 1)).unwrap();
        ledger.mark_done(ProgressMarker::now(2, "", 0)).unwrap();
        assert_eq!(ledger.check_integrity(&shards, &HashSet::new()), vec![1]);
        let merged: HashSet<String> = ["gone.parquet".to_string()].into();
        assert!(ledger.check_integrity(&shards, &merged).is_empty());
    }
}
