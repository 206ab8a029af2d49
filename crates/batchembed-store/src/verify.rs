//! Read-only inspection of shard and consolidated files.
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use arrow_array::{Array, StringArray};
use tracing::{info, warn};

use crate::consolidate::Manifest;
use crate::error::{Result, StoreError};
use crate::schema::{META_DIM, META_MODEL_ID, ID_COLUMN};
use crate::shard::{column, open_reader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub rows: u64,
    pub row_groups: usize,
    pub schema: String,
    pub model_id: Option<String>,
    pub dim: Option<usize>,
    /// Only computed when requested.
    pub duplicate_ids: Option<u64>,
}

/// Row count, schema and metadata of one Parquet file. With
/// `check_duplicates`, every id is read and repeats are counted.
pub fn inspect_file(path: &Path, check_duplicates: bool) -> Result<FileReport> {
    let builder = open_reader(path)?;
    let schema = builder.schema().clone();
    let md = builder.metadata();
    let rows = u64::try_from(md.file_metadata().num_rows()).unwrap_or(0);
    let row_groups = md.num_row_groups();
    let model_id = schema.metadata().get(META_MODEL_ID).cloned();
    let dim = schema.metadata().get(META_DIM).and_then(|d| d.parse().ok());

    let duplicate_ids = if check_duplicates {
        let mut seen = HashSet::new();
        let mut dups = 0u64;
        for batch in builder.build()? {
            let batch = batch?;
            let ids = column::<StringArray>(&batch, ID_COLUMN, path)?;
            for i in 0..ids.len() {
                if !seen.insert(ids.value(i).to_string()) {
                    dups += 1;
                }
            }
        }
        Some(dups)
    } else {
        None
    };

    let report = FileReport {
        path: path.to_path_buf(),
        rows,
        row_groups,
        schema: format!("{schema}"),
        model_id,
        dim,
        duplicate_ids,
    };
    info!(path = %path.display(), rows, row_groups, "file read");
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidatedReport {
    pub parts: Vec<FileReport>,
    pub total_records: u64,
}

/// Check a consolidated directory against its manifest: every part present,
/// row counts as recorded, no id repeated across parts.
pub fn verify_consolidated(dir: &Path) -> Result<ConsolidatedReport> {
    let manifest = Manifest::load(dir)?;
    let mut parts = Vec::with_capacity(manifest.parts.len());
    let mut seen: HashSet<String> = HashSet::new();
    let mut total = 0u64;
    for part in &manifest.parts {
        let path = dir.join(&part.file);
        let report = inspect_file(&path, false)?;
        if report.rows != part.records {
            return Err(StoreError::Integrity(format!(
                "{} has {} rows, manifest says {}",
                part.file, report.rows, part.records
            )));
        }
        if report.model_id.as_deref() != Some(manifest.model_id.as_str()) {
            warn!(part = %part.file, "model_id metadata differs from manifest");
        }
        for batch in open_reader(&path)?.build()? {
            let batch = batch?;
            let ids = column::<StringArray>(&batch, ID_COLUMN, &path)?;
            for i in 0..ids.len() {
                if !seen.insert(ids.value(i).to_string()) {
                    return Err(StoreError::Integrity(format!("id `{}` repeated in {}", ids.value(i), part.file)));
                }
            }
        }
        total += report.rows;
        parts.push(report);
    }
    if total != manifest.total_records {
        return Err(StoreError::Integrity(format!(
            "parts hold {total} records, manifest says {}",
            manifest.total_records
        )));
    }
    Ok(ConsolidatedReport { parts, total_records: total })
}
