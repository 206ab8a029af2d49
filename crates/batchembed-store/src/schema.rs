use std::collections::HashMap;
use std::sync::Arc;

use arrow_schema::{DataType, Field, FieldRef, Schema, SchemaRef};
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;

use batchembed_core::types::ChunkId;

use crate::error::{Result, StoreError};

pub const ID_COLUMN: &str = "id";
pub const CHUNK_ID_COLUMN: &str = "chunk_id";
pub const MODEL_ID_COLUMN: &str = "model_id";
pub const VECTOR_COLUMN: &str = "vector";

pub const META_MODEL_ID: &str = "model_id";
pub const META_DIM: &str = "dim";
pub const META_FIRST_CHUNK: &str = "first_chunk";
pub const META_LAST_CHUNK: &str = "last_chunk";

pub fn vector_item_field() -> FieldRef {
    Arc::new(Field::new("item", DataType::Float32, true))
}

pub fn vector_width(dim: usize) -> Result<i32> {
    i32::try_from(dim).map_err(|_| StoreError::InvalidConfig(format!("dim {dim} does not fit a fixed-size list")))
}

/// Self-describing metadata stored in every shard and consolidated part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardMeta {
    pub model_id: String,
    pub dim: usize,
    pub first_chunk: ChunkId,
    pub last_chunk: ChunkId,
}

impl ShardMeta {
    pub fn to_metadata(&self) -> HashMap<String, String> {
        HashMap::from([
            (META_MODEL_ID.to_string(), self.model_id.clone()),
            (META_DIM.to_string(), self.dim.to_string()),
            (META_FIRST_CHUNK.to_string(), self.first_chunk.to_string()),
            (META_LAST_CHUNK.to_string(), self.last_chunk.to_string()),
        ])
    }

    /// Read back from a schema written by [`build_shard_schema`].
    pub fn from_schema(path: &std::path::Path, schema: &Schema) -> Result<Self> {
        let md = schema.metadata();
        let get = |key: &str| {
            md.get(key).ok_or_else(|| StoreError::invalid(path, format!("missing schema metadata `{key}`")))
        };
        let num = |key: &str| -> Result<u64> {
            get(key)?.parse::<u64>().map_err(|e| StoreError::invalid(path, format!("bad `{key}` metadata: {e}")))
        };
        Ok(Self {
            model_id: get(META_MODEL_ID)?.clone(),
            dim: num(META_DIM)? as usize,
            first_chunk: num(META_FIRST_CHUNK)?,
            last_chunk: num(META_LAST_CHUNK)?,
        })
    }
}

pub fn build_shard_schema(meta: &ShardMeta) -> Result<SchemaRef> {
    let width = vector_width(meta.dim)?;
    Ok(Arc::new(Schema::new_with_metadata(
        vec![
            Field::new(ID_COLUMN, DataType::Utf8, false),
            Field::new(CHUNK_ID_COLUMN, DataType::UInt64, false),
            Field::new(MODEL_ID_COLUMN, DataType::Utf8, false),
            Field::new(VECTOR_COLUMN, DataType::FixedSizeList(vector_item_field(), width), false),
        ],
        meta.to_metadata(),
    )))
}

/// zstd-compressed output, optionally capping rows per row group.
pub fn writer_properties(row_group_size: Option<usize>) -> WriterProperties {
    let builder = WriterProperties::builder().set_compression(Compression::ZSTD(ZstdLevel::default()));
    match row_group_size {
        Some(rows) => builder.set_max_row_group_size(rows.max(1)).build(),
        None => builder.build(),
    }
}
