//! Offline merge of many small shards into a few large parts.
//!
//! Runs after dispatch is complete. Shards are grouped whole, in chunk order,
//! into `consolidated-part-{n:05}.parquet` files of at most
//! `max_records_per_file` rows, followed by `_manifest.json`. While every
//! source is still present the output is a pure function of the shard set.
//! Parts whose sources were deleted are carried into the next manifest
//! unchanged and new parts are numbered after them.
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use arrow_array::{Array, RecordBatch, StringArray};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use batchembed_core::config::ConsolidateSettings;
use batchembed_core::types::ChunkId;

use crate::error::{Result, StoreError};
use crate::fsio::{self, STAGING_DIR};
use crate::schema::{build_shard_schema, writer_properties, ShardMeta, ID_COLUMN};
use crate::shard::{column, list_shards, open_reader, parse_shard_name, ShardRef};

pub const MANIFEST_FILE: &str = "_manifest.json";
const PART_PREFIX: &str = "consolidated-part-";
const PART_EXT: &str = ".parquet";

pub fn part_file_name(n: usize) -> String {
    format!("{PART_PREFIX}{n:05}{PART_EXT}")
}

fn parse_part_name(name: &str) -> Option<usize> {
    name.strip_prefix(PART_PREFIX)?.strip_suffix(PART_EXT)?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPart {
    pub file: String,
    pub records: u64,
    pub first_chunk: ChunkId,
    pub last_chunk: ChunkId,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub created_at: DateTime<Utc>,
    pub model_id: String,
    pub dim: usize,
    pub total_records: u64,
    pub parts: Vec<ManifestPart>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Shard names merged into the output at `dir`, empty when nothing has been
/// consolidated there yet.
pub fn consolidated_sources(dir: &Path) -> Result<HashSet<String>> {
    if !dir.join(MANIFEST_FILE).exists() {
        return Ok(HashSet::new());
    }
    let manifest = Manifest::load(dir)?;
    Ok(manifest.parts.into_iter().flat_map(|p| p.sources).collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidateReport {
    /// Shards merged by this run.
    pub shards: usize,
    /// Parts in the manifest, carried ones included.
    pub parts: usize,
    /// Parts from an earlier run kept as-is because their sources are gone.
    pub carried_parts: usize,
    pub records: u64,
    /// Shards left alone because their chunks have no ledger marker.
    pub skipped_unmarked: usize,
    pub stale_parts_removed: usize,
    pub sources_deleted: usize,
}

struct ScannedShard {
    shard: ShardRef,
    rows: u64,
}

/// Parts of a previous manifest that can no longer be rebuilt because at
/// least one of their sources was deleted. They are kept verbatim and their
/// remaining sources are never merged again.
struct Carried {
    model_id: String,
    dim: usize,
    parts: Vec<ManifestPart>,
    sources: HashSet<String>,
}

impl Carried {
    fn next_part_number(&self) -> usize {
        self.parts.iter().filter_map(|p| parse_part_name(&p.file)).map(|n| n + 1).max().unwrap_or(0)
    }

    fn covers_chunks_of(&self, shard: &ShardRef) -> Option<&str> {
        self.sources
            .iter()
            .filter_map(|name| parse_shard_name(name).map(|(first, last)| (name, first, last)))
            .find(|(_, first, last)| shard.first_chunk <= *last && *first <= shard.last_chunk)
            .map(|(name, _, _)| name.as_str())
    }
}

/// Greedy grouping of whole shards under `cap` rows. A shard larger than the
/// cap gets a part of its own.
pub fn plan_groups(row_counts: &[u64], cap: u64) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut current_rows = 0u64;
    for (i, &rows) in row_counts.iter().enumerate() {
        if !current.is_empty() && current_rows + rows > cap {
            groups.push(std::mem::take(&mut current));
            current_rows = 0;
        }
        current.push(i);
        current_rows += rows;
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

pub struct Consolidator {
    settings: ConsolidateSettings,
    show_progress: bool,
    done: Option<BTreeSet<ChunkId>>,
}

impl Consolidator {
    pub fn new(settings: ConsolidateSettings) -> Result<Self> {
        settings.validate().map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        Ok(Self { settings, show_progress: false, done: None })
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Only merge shards whose chunks are all in `done` (the ledger's done
    /// set). Shards written just before a crash, with no marker yet, stay put.
    pub fn with_done(mut self, done: BTreeSet<ChunkId>) -> Self {
        self.done = Some(done);
        self
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} shards {msg}")
            .map(|s| s.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb
    }

    pub fn run(&self) -> Result<ConsolidateReport> {
        let shard_dir = &self.settings.shard_dir;
        let out_dir = &self.settings.output_dir;
        let present = list_shards(shard_dir)?;
        let carried = self.carried_parts(&present)?;

        let mut leftovers = Vec::new();
        let mut fresh = Vec::new();
        let mut skipped_unmarked = 0;
        for shard in present {
            if carried.as_ref().is_some_and(|c| c.sources.contains(&shard.file_name())) {
                leftovers.push(shard);
            } else if self.is_marked(&shard) {
                fresh.push(shard);
            } else {
                warn!(shard = %shard.file_name(), "no ledger marker for this shard; leaving it out");
                skipped_unmarked += 1;
            }
        }

        if fresh.is_empty() {
            let Some(carried) = carried else {
                info!(dir = %shard_dir.display(), "no shards to consolidate");
                return Ok(ConsolidateReport { skipped_unmarked, ..ConsolidateReport::default() });
            };
            let sources_deleted = self.delete_sources(shard_dir, &leftovers)?;
            let report = ConsolidateReport {
                parts: carried.parts.len(),
                carried_parts: carried.parts.len(),
                records: carried.parts.iter().map(|p| p.records).sum(),
                skipped_unmarked,
                sources_deleted,
                ..ConsolidateReport::default()
            };
            info!(?report, "nothing new to consolidate");
            return Ok(report);
        }

        check_overlaps(&fresh)?;
        if let Some(c) = &carried {
            for shard in &fresh {
                if let Some(source) = c.covers_chunks_of(shard) {
                    return Err(StoreError::Integrity(format!(
                        "{} overlaps {source}, which is already consolidated",
                        shard.file_name()
                    )));
                }
            }
        }

        let mut seen: HashSet<String> = HashSet::new();
        if let Some(c) = &carried {
            for part in &c.parts {
                collect_ids(&out_dir.join(&part.file), &mut seen)?;
            }
        }
        let (meta, scanned) = self.scan(fresh, &mut seen)?;
        if let Some(c) = carried.as_ref().filter(|c| c.model_id != meta.model_id || c.dim != meta.dim) {
            return Err(StoreError::Integrity(format!(
                "new shards hold {}/{} vectors but consolidated output holds {}/{}",
                meta.model_id, meta.dim, c.model_id, c.dim
            )));
        }

        let counts: Vec<u64> = scanned.iter().map(|s| s.rows).collect();
        let groups = plan_groups(&counts, self.settings.max_records_per_file as u64);
        let first_number = carried.as_ref().map_or(0, Carried::next_part_number);
        info!(shards = scanned.len(), parts = groups.len(), first_number, "consolidating");

        fsio::ensure_dir(out_dir)?;
        let staging = out_dir.join(STAGING_DIR);
        fsio::cleanup_staging(&staging)?;
        let pb = self.progress_bar(scanned.len() as u64);
        let (mut parts, carried_parts) = match carried {
            Some(c) => {
                let n = c.parts.len();
                (c.parts, n)
            }
            None => (Vec::new(), 0),
        };
        for (i, group) in groups.iter().enumerate() {
            let members: Vec<&ScannedShard> = group.iter().map(|&i| &scanned[i]).collect();
            parts.push(self.write_part(first_number + i, &meta, &members, &staging)?);
            pb.inc(members.len() as u64);
        }
        pb.finish_with_message("done");

        let total_records = parts.iter().map(|p| p.records).sum();
        let manifest = Manifest {
            created_at: Utc::now(),
            model_id: meta.model_id.clone(),
            dim: meta.dim,
            total_records,
            parts,
        };
        fsio::write_json_atomic(&staging, &out_dir.join(MANIFEST_FILE), &manifest)?;
        let keep: HashSet<&str> = manifest.parts.iter().map(|p| p.file.as_str()).collect();
        let stale_parts_removed = remove_stale_parts(out_dir, &keep)?;

        leftovers.extend(scanned.into_iter().map(|s| s.shard));
        let sources_deleted = self.delete_sources(shard_dir, &leftovers)?;

        let report = ConsolidateReport {
            shards: counts.len(),
            parts: manifest.parts.len(),
            carried_parts,
            records: total_records,
            skipped_unmarked,
            stale_parts_removed,
            sources_deleted,
        };
        info!(?report, dir = %out_dir.display(), "consolidation complete");
        Ok(report)
    }

    fn is_marked(&self, shard: &ShardRef) -> bool {
        match &self.done {
            Some(done) => (shard.first_chunk..=shard.last_chunk).all(|c| done.contains(&c)),
            None => true,
        }
    }

    /// Parts of the existing manifest with at least one source missing from
    /// `present`. Their files must still exist.
    fn carried_parts(&self, present: &[ShardRef]) -> Result<Option<Carried>> {
        let out_dir = &self.settings.output_dir;
        if !out_dir.join(MANIFEST_FILE).exists() {
            return Ok(None);
        }
        let manifest = Manifest::load(out_dir)?;
        let names: HashSet<String> = present.iter().map(ShardRef::file_name).collect();
        let parts: Vec<ManifestPart> =
            manifest.parts.into_iter().filter(|p| p.sources.iter().any(|s| !names.contains(s))).collect();
        if parts.is_empty() {
            return Ok(None);
        }
        if let Some(lost) = parts.iter().find(|p| !out_dir.join(&p.file).exists()) {
            return Err(StoreError::Integrity(format!(
                "{} is listed in the manifest but missing, and its source shards are gone",
                lost.file
            )));
        }
        let sources = parts.iter().flat_map(|p| p.sources.iter().cloned()).collect();
        info!(parts = parts.len(), "keeping parts whose sources were deleted");
        Ok(Some(Carried { model_id: manifest.model_id, dim: manifest.dim, parts, sources }))
    }

    fn delete_sources(&self, shard_dir: &Path, shards: &[ShardRef]) -> Result<usize> {
        if !self.settings.delete_sources || shards.is_empty() {
            return Ok(0);
        }
        for s in shards {
            fs::remove_file(&s.path).map_err(|e| StoreError::io(&s.path, e))?;
        }
        fsio::sync_dir(shard_dir)?;
        Ok(shards.len())
    }

    /// Read every shard's metadata and ids before writing anything, so a bad
    /// shard set aborts with the output directory untouched.
    fn scan(&self, shards: Vec<ShardRef>, seen: &mut HashSet<String>) -> Result<(ShardMeta, Vec<ScannedShard>)> {
        let pb = self.progress_bar(shards.len() as u64);
        pb.set_message("checking");
        let mut common: Option<ShardMeta> = None;
        let mut scanned = Vec::with_capacity(shards.len());
        for shard in shards {
            let meta = ShardMeta::from_schema(&shard.path, open_reader(&shard.path)?.schema())?;
            match &common {
                None => common = Some(meta.clone()),
                Some(c) if c.model_id != meta.model_id || c.dim != meta.dim => {
                    return Err(StoreError::Integrity(format!(
                        "{} holds {}/{} vectors, expected {}/{}",
                        shard.path.display(),
                        meta.model_id,
                        meta.dim,
                        c.model_id,
                        c.dim
                    )));
                }
                Some(_) => {}
            }
            let rows = collect_ids(&shard.path, seen)?;
            scanned.push(ScannedShard { shard, rows });
            pb.inc(1);
        }
        pb.finish_and_clear();
        let meta = common.ok_or_else(|| StoreError::Integrity("no readable shards".into()))?;
        Ok((meta, scanned))
    }

    fn write_part(
        &self,
        n: usize,
        meta: &ShardMeta,
        members: &[&ScannedShard],
        staging: &Path,
    ) -> Result<ManifestPart> {
        let first_chunk = members.first().map(|s| s.shard.first_chunk).unwrap_or_default();
        let last_chunk = members.last().map(|s| s.shard.last_chunk).unwrap_or_default();
        let part_meta = ShardMeta { first_chunk, last_chunk, ..meta.clone() };
        let schema = build_shard_schema(&part_meta)?;
        let file = part_file_name(n);
        let dest = self.settings.output_dir.join(&file);
        let props = writer_properties(Some(self.settings.row_group_size));
        let records = fsio::write_atomic(staging, &dest, |out| {
            let mut writer = ArrowWriter::try_new(out, schema.clone(), Some(props))?;
            let mut written = 0u64;
            for s in members {
                for batch in open_reader(&s.shard.path)?.build()? {
                    let batch = batch?;
                    let batch = RecordBatch::try_new(schema.clone(), batch.columns().to_vec())?;
                    written += batch.num_rows() as u64;
                    writer.write(&batch)?;
                }
            }
            writer.close()?;
            Ok(written)
        })?;
        info!(part = %dest.display(), records, sources = members.len(), "part written");
        Ok(ManifestPart {
            file,
            records,
            first_chunk,
            last_chunk,
            sources: members.iter().map(|s| s.shard.file_name()).collect(),
        })
    }
}

/// Add every id of the file at `path` to `seen`, failing on the first repeat.
/// Only the id column is read. Returns the file's row count.
fn collect_ids(path: &Path, seen: &mut HashSet<String>) -> Result<u64> {
    let builder = open_reader(path)?;
    let id_idx = builder.schema().index_of(ID_COLUMN)?;
    let mask = ProjectionMask::roots(builder.parquet_schema(), [id_idx]);
    let rows = u64::try_from(builder.metadata().file_metadata().num_rows()).unwrap_or(0);
    for batch in builder.with_projection(mask).build()? {
        let batch = batch?;
        let ids = column::<StringArray>(&batch, ID_COLUMN, path)?;
        for i in 0..ids.len() {
            let id = ids.value(i);
            if !seen.insert(id.to_string()) {
                return Err(StoreError::Integrity(format!(
                    "record id `{id}` appears more than once (again in {})",
                    path.display()
                )));
            }
        }
    }
    Ok(rows)
}

fn check_overlaps(shards: &[ShardRef]) -> Result<()> {
    for pair in shards.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(StoreError::Integrity(format!(
                "shards {} and {} cover overlapping chunk ranges",
                pair[0].file_name(),
                pair[1].file_name()
            )));
        }
    }
    Ok(())
}

/// Remove part files not listed in the new manifest.
fn remove_stale_parts(dir: &Path, keep: &HashSet<&str>) -> Result<usize> {
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    let mut stale: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if parse_part_name(name).is_some() && !keep.contains(name) {
            stale.push(entry.path());
        }
    }
    for path in &stale {
        warn!(part = %path.display(), "removing stale part");
        fs::remove_file(path).map_err(|e| StoreError::io(path, e))?;
    }
    if !stale.is_empty() {
        fsio::sync_dir(dir)?;
    }
    Ok(stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_respect_cap_and_keep_oversized_shards_alone() {
        assert_eq!(plan_groups(&[100; 4], 200), vec![vec![0, 1], vec![2, 3]]);
        assert_eq!(plan_groups(&[50, 500, 50], 200), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(plan_groups(&[], 10), Vec::<Vec<usize>>::new());
    }

    #[test]
    fn part_names_roundtrip() {
        assert_eq!(part_file_name(7), "consolidated-part-00007.parquet");
        assert_eq!(parse_part_name("consolidated-part-00007.parquet"), Some(7));
        assert_eq!(parse_part_name(MANIFEST_FILE), None);
    }
}
