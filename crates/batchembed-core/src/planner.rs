//! Deterministic chunk planning over a [`RecordSource`].
//!
//! Chunk `k` covers input lines `[k * chunk_size, (k + 1) * chunk_size)`.
//! Chunks already in the done set are fast-forwarded without parsing. When
//! the input runs out, any done id at or beyond the last chunk means the
//! input shrank since those markers were written; that surfaces as
//! [`Error::Integrity`] and ends the iteration.
use std::collections::BTreeSet;
use std::io::BufRead;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::source::{RecordSource, SourceLine};
use crate::types::{Chunk, ChunkId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanStats {
    pub planned: u64,
    pub skipped_done: u64,
    pub skipped_filtered: u64,
    /// Known once the input is exhausted.
    pub total_chunks: Option<u64>,
}

pub struct ChunkPlanner<R> {
    source: RecordSource<R>,
    chunk_size: u64,
    done: BTreeSet<ChunkId>,
    only: Option<BTreeSet<ChunkId>>,
    next_chunk: ChunkId,
    finished: bool,
    stats: PlanStats,
}

impl<R: BufRead> ChunkPlanner<R> {
    pub fn new(source: RecordSource<R>, chunk_size: usize, done: BTreeSet<ChunkId>) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be > 0".into()));
        }
        Ok(Self {
            source,
            chunk_size: chunk_size as u64,
            done,
            only: None,
            next_chunk: 0,
            finished: false,
            stats: PlanStats::default(),
        })
    }

    /// Restrict planning to the given chunk ids (targeted re-run).
    pub fn with_only(mut self, ids: BTreeSet<ChunkId>) -> Self {
        self.only = Some(ids);
        self
    }

    pub fn stats(&self) -> PlanStats {
        self.stats
    }

    fn is_excluded(&self, id: ChunkId) -> Option<bool> {
        if self.done.contains(&id) {
            return Some(true);
        }
        match &self.only {
            Some(only) if !only.contains(&id) => Some(false),
            _ => None,
        }
    }

    fn finish(&mut self) -> Option<Result<Chunk>> {
        self.finished = true;
        let total = self.next_chunk;
        self.stats.total_chunks = Some(total);
        if let Some(only) = &self.only {
            let missing: Vec<_> = only.range(total..).collect();
            if !missing.is_empty() {
                warn!(?missing, total_chunks = total, "requested chunks do not exist in the input");
            }
        }
        match self.done.range(total..).next() {
            Some(&beyond) => Some(Err(Error::Integrity(format!(
                "ledger marks chunk {} done but the input only yields {} chunks; \
                 the input file is shorter than when that chunk was processed",
                beyond, total
            )))),
            None => None,
        }
    }

    fn read_chunk(&mut self, chunk_id: ChunkId) -> Result<Option<Chunk>> {
        let start_line = self.source.line_no();
        let mut records = Vec::new();
        let mut lines = 0u64;
        while lines < self.chunk_size {
            match self.source.next_line()? {
                None => break,
                Some(SourceLine::Record(r)) => records.push(r),
                Some(SourceLine::Skipped) => {}
            }
            lines += 1;
        }
        if lines == 0 {
            return Ok(None);
        }
        Ok(Some(Chunk::pending(chunk_id, start_line, lines, records)))
    }
}

impl<R: BufRead> Iterator for ChunkPlanner<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let chunk_id = self.next_chunk;
            if let Some(was_done) = self.is_excluded(chunk_id) {
                match self.source.skip_lines(self.chunk_size) {
                    Ok(0) => return self.finish(),
                    Ok(_) => {
                        if was_done {
                            debug!(chunk_id, "skipping already processed chunk");
                            self.stats.skipped_done += 1;
                        } else {
                            self.stats.skipped_filtered += 1;
                        }
                        self.next_chunk += 1;
                        continue;
                    }
                    Err(e) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
            }
            return match self.read_chunk(chunk_id) {
                Ok(Some(chunk)) => {
                    self.next_chunk += 1;
                    self.stats.planned += 1;
                    Some(Ok(chunk))
                }
                Ok(None) => self.finish(),
                Err(e) => {
                    self.finished = true;
                    Some(Err(e))
                }
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn corpus(n: usize) -> String {
        (0..n).map(|i| format!("{{\"_id\":\"r{i}\",\"text\":\"text {i}\"}}\n")).collect()
    }

    fn planner(n: usize, size: usize, done: &[u64]) -> ChunkPlanner<Cursor<Vec<u8>>> {
        let src = RecordSource::from_reader(Cursor::new(corpus(n).into_bytes()), "mem", None);
        ChunkPlanner::new(src, size, done.iter().copied().collect()).unwrap()
    }

    #[test]
    fn plans_ceil_n_over_c_chunks() {
        for (n, c) in [(100, 10), (101, 10), (9, 10), (1, 1), (0, 5)] {
            let chunks: Vec<_> = planner(n, c, &[]).map(|c| c.unwrap()).collect();
            assert_eq!(chunks.len(), n.div_ceil(c), "n={n} c={c}");
            let total: usize = chunks.iter().map(|c| c.records.len()).sum();
            assert_eq!(total, n);
        }
    }

    #[test]
    fn last_chunk_may_be_short_and_ids_follow_offsets() {
        let chunks: Vec<_> = planner(25, 10, &[]).map(|c| c.unwrap()).collect();
        assert_eq!(chunks.iter().map(|c| c.chunk_id).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(chunks[2].start_line, 20);
        assert_eq!(chunks[2].records.len(), 5);
        assert_eq!(chunks[1].records[0].id, "r10");
    }

    #[test]
    fn done_chunks_are_skipped_deterministically() {
        let first: Vec<_> = planner(50, 10, &[1, 3]).map(|c| c.unwrap()).collect();
        let second: Vec<_> = planner(50, 10, &[1, 3]).map(|c| c.unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(first.iter().map(|c| c.chunk_id).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(first[1].records[0].id, "r20");
    }

    #[test]
    fn only_filter_restricts_plan() {
        let mut p = planner(50, 10, &[]).with_only([2, 4].into_iter().collect());
        let ids: Vec<_> = p.by_ref().map(|c| c.unwrap().chunk_id).collect();
        assert_eq!(ids, vec![2, 4]);
        let stats = p.stats();
        assert_eq!(stats.skipped_filtered, 3);
        assert_eq!(stats.total_chunks, Some(5));
    }

    #[test]
    fn shrunken_input_is_an_integrity_error() {
        let items: Vec<_> = planner(30, 10, &[0, 5]).collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(matches!(items[2], Err(Error::Integrity(_))));
    }

    #[test]
    fn malformed_lines_keep_chunk_boundaries() {
        let mut input = corpus(3);
        input.push_str("garbage\n");
        input.push_str(&corpus(1).replace("r0", "r3"));
        let src = RecordSource::from_reader(Cursor::new(input.into_bytes()), "mem", None);
        let chunks: Vec<_> = ChunkPlanner::new(src, 2, BTreeSet::new()).unwrap().map(|c| c.unwrap()).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].line_count, 2);
        assert_eq!(chunks[1].records.len(), 1);
        assert_eq!(chunks[2].records[0].id, "r3");
    }
}
