//! Immutable Parquet shards, one per completed chunk.
//!
//! A shard is staged under `<shard_dir>/.tmp`, fsynced and renamed into
//! place, so a reader never observes a partial file under a final name.
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, FixedSizeListArray, Float32Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::SchemaRef;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use tracing::debug;

use batchembed_core::types::{ChunkId, EmbeddingResult};

use crate::error::{Result, StoreError};
use crate::fsio::{self, STAGING_DIR};
use crate::schema::{
    build_shard_schema, vector_item_field, vector_width, writer_properties, ShardMeta, CHUNK_ID_COLUMN, ID_COLUMN,
    MODEL_ID_COLUMN, VECTOR_COLUMN,
};

const SHARD_PREFIX: &str = "shard-";
const SHARD_EXT: &str = ".parquet";

pub fn shard_file_name(first: ChunkId, last: ChunkId) -> String {
    format!("{SHARD_PREFIX}{first:012}-{last:012}{SHARD_EXT}")
}

/// Inverse of [`shard_file_name`].
pub fn parse_shard_name(name: &str) -> Option<(ChunkId, ChunkId)> {
    let range = name.strip_prefix(SHARD_PREFIX)?.strip_suffix(SHARD_EXT)?;
    let (first, last) = range.split_once('-')?;
    let first = first.parse().ok()?;
    let last = last.parse().ok()?;
    (first <= last).then_some((first, last))
}

/// A shard on disk, known by the chunk range encoded in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardRef {
    pub path: PathBuf,
    pub first_chunk: ChunkId,
    pub last_chunk: ChunkId,
}

impl ShardRef {
    pub fn overlaps(&self, other: &ShardRef) -> bool {
        self.first_chunk <= other.last_chunk && other.first_chunk <= self.last_chunk
    }

    pub fn file_name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

/// Shards in `dir`, sorted by chunk range. Missing directory means none.
pub fn list_shards(dir: &Path) -> Result<Vec<ShardRef>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut shards = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        let name = entry.file_name();
        let Some((first, last)) = name.to_str().and_then(parse_shard_name) else { continue };
        shards.push(ShardRef { path: entry.path(), first_chunk: first, last_chunk: last });
    }
    shards.sort_by_key(|s| (s.first_chunk, s.last_chunk));
    Ok(shards)
}

/// One persisted row.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardRow {
    pub chunk_id: ChunkId,
    pub result: EmbeddingResult,
}

#[derive(Debug, Clone)]
pub struct ShardContents {
    pub meta: ShardMeta,
    pub rows: Vec<ShardRow>,
}

pub fn rows_to_batch(schema: &SchemaRef, dim: usize, rows: &[ShardRow]) -> Result<RecordBatch> {
    let mut flat = Vec::with_capacity(rows.len() * dim);
    for row in rows {
        if row.result.vector.len() != dim {
            return Err(StoreError::Integrity(format!(
                "vector for `{}` has length {}, shard dim is {}",
                row.result.id,
                row.result.vector.len(),
                dim
            )));
        }
        flat.extend_from_slice(&row.result.vector);
    }
    let ids = StringArray::from_iter_values(rows.iter().map(|r| r.result.id.as_str()));
    let chunk_ids = UInt64Array::from_iter_values(rows.iter().map(|r| r.chunk_id));
    let models = StringArray::from_iter_values(rows.iter().map(|r| r.result.model_id.as_str()));
    let vectors =
        FixedSizeListArray::try_new(vector_item_field(), vector_width(dim)?, Arc::new(Float32Array::from(flat)), None)?;
    Ok(RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(ids), Arc::new(chunk_ids), Arc::new(models), Arc::new(vectors)],
    )?)
}

pub(crate) fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str, path: &Path) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| StoreError::invalid(path, format!("missing or mistyped column `{name}`")))
}

pub fn batch_to_rows(path: &Path, batch: &RecordBatch) -> Result<Vec<ShardRow>> {
    let ids = column::<StringArray>(batch, ID_COLUMN, path)?;
    let chunk_ids = column::<UInt64Array>(batch, CHUNK_ID_COLUMN, path)?;
    let models = column::<StringArray>(batch, MODEL_ID_COLUMN, path)?;
    let vectors = column::<FixedSizeListArray>(batch, VECTOR_COLUMN, path)?;
    (0..batch.num_rows())
        .map(|i| {
            let values = vectors.value(i);
            let values = values
                .as_primitive_opt::<Float32Type>()
                .ok_or_else(|| StoreError::invalid(path, "vector items are not f32"))?;
            Ok(ShardRow {
                chunk_id: chunk_ids.value(i),
                result: EmbeddingResult {
                    id: ids.value(i).to_string(),
                    model_id: models.value(i).to_string(),
                    vector: values.values().to_vec(),
                },
            })
        })
        .collect()
}

pub(crate) fn open_reader(path: &Path) -> Result<ParquetRecordBatchReaderBuilder<File>> {
    let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
    Ok(ParquetRecordBatchReaderBuilder::try_new(file)?)
}

/// Load a whole shard into memory.
pub fn read_shard(path: &Path) -> Result<ShardContents> {
    let builder = open_reader(path)?;
    let meta = ShardMeta::from_schema(path, builder.schema())?;
    let mut rows = Vec::new();
    for batch in builder.build()? {
        rows.extend(batch_to_rows(path, &batch?)?);
    }
    Ok(ShardContents { meta, rows })
}

/// Writes chunk results into `<dir>/shard-{first}-{last}.parquet`.
#[derive(Debug, Clone)]
pub struct ShardWriter {
    dir: PathBuf,
    staging: PathBuf,
    model_id: String,
    dim: usize,
}

impl ShardWriter {
    pub fn new(dir: &Path, model_id: &str, dim: usize) -> Result<Self> {
        vector_width(dim)?;
        fsio::ensure_dir(dir)?;
        let staging = dir.join(STAGING_DIR);
        fsio::ensure_dir(&staging)?;
        Ok(Self { dir: dir.to_path_buf(), staging, model_id: model_id.to_string(), dim })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Drop temporaries from a previous interrupted run.
    pub fn cleanup_staging(&self) -> Result<usize> {
        fsio::cleanup_staging(&self.staging)
    }

    /// Persist one chunk's results in input order and return the shard file
    /// name. An existing shard of the same name is replaced whole.
    pub fn write_chunk(&self, chunk_id: ChunkId, results: &[EmbeddingResult]) -> Result<String> {
        let rows: Vec<ShardRow> =
            results.iter().map(|r| ShardRow { chunk_id, result: r.clone() }).collect();
        let shard = self.write_rows(chunk_id, chunk_id, &rows)?;
        Ok(shard.file_name())
    }

    pub fn write_rows(&self, first: ChunkId, last: ChunkId, rows: &[ShardRow]) -> Result<ShardRef> {
        let meta = ShardMeta { model_id: self.model_id.clone(), dim: self.dim, first_chunk: first, last_chunk: last };
        let schema = build_shard_schema(&meta)?;
        let batch = rows_to_batch(&schema, self.dim, rows)?;
        let dest = self.dir.join(shard_file_name(first, last));
        fsio::write_atomic(&self.staging, &dest, |file| {
            let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(writer_properties(None)))?;
            writer.write(&batch)?;
            writer.close()?;
            Ok(())
        })?;
        debug!(shard = %dest.display(), rows = rows.len(), "shard written");
        Ok(ShardRef { path: dest, first_chunk: first, last_chunk: last })
    }
}
