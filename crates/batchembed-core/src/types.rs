//! Domain types shared by the planner, dispatcher and store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type ChunkId = u64;

/// One input document. `id` is unique across the corpus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

impl ChunkStatus {
    /// Legal moves: Pending -> InFlight -> {Done, Failed}, and Failed -> Pending
    /// when a chunk is replanned.
    pub fn can_move_to(self, next: ChunkStatus) -> bool {
        matches!(
            (self, next),
            (ChunkStatus::Pending, ChunkStatus::InFlight)
                | (ChunkStatus::InFlight, ChunkStatus::Done)
                | (ChunkStatus::InFlight, ChunkStatus::Failed)
                | (ChunkStatus::Failed, ChunkStatus::Pending)
        )
    }
}

/// A fixed-size slice of the input, the unit of retry and progress tracking.
///
/// - `chunk_id`: `start_line / chunk_size`, stable across restarts
/// - `start_line`: zero-based index of the first input line in the chunk
/// - `line_count`: input lines covered, including skipped ones
/// - `records`: valid records in input order
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub start_line: u64,
    pub line_count: u64,
    pub records: Vec<Record>,
    pub status: ChunkStatus,
}

impl Chunk {
    pub fn pending(chunk_id: ChunkId, start_line: u64, line_count: u64, records: Vec<Record>) -> Self {
        Self { chunk_id, start_line, line_count, records, status: ChunkStatus::Pending }
    }

    pub fn transition(&mut self, next: ChunkStatus) -> Result<()> {
        if !self.status.can_move_to(next) {
            return Err(Error::InvalidTransition { chunk_id: self.chunk_id, from: self.status, to: next });
        }
        self.status = next;
        Ok(())
    }

    pub fn texts(&self) -> Vec<String> {
        self.records.iter().map(|r| r.text.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Embedding of one record as persisted in shard files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub id: String,
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// Durable proof that a chunk's shard is in place.
///
/// `shard` is the file name inside the shard directory, empty when the chunk
/// held no valid records and nothing was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMarker {
    pub chunk_id: ChunkId,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub shard: String,
    #[serde(default)]
    pub records: u64,
}

impl ProgressMarker {
    pub fn now(chunk_id: ChunkId, shard: impl Into<String>, records: u64) -> Self {
        Self { chunk_id, completed_at: Utc::now(), shard: shard.into(), records }
    }
}
