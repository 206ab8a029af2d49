//! Bounded worker pool that pulls planned chunks, embeds them through the
//! endpoint pool and persists shard-then-marker.
//!
//! The planner runs on a blocking thread feeding a channel of capacity
//! `concurrency`, so it can never get further ahead than the workers allow.
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use batchembed_backend::vectors::validate_vectors;
use batchembed_backend::Balancer;
use batchembed_core::config::{BackendSettings, PipelineSettings};
use batchembed_core::planner::{ChunkPlanner, PlanStats};
use batchembed_core::source::{RecordSource, TextCleaner};
use batchembed_core::types::{Chunk, ChunkId, ChunkStatus, EmbeddingResult, ProgressMarker};
use batchembed_core::{BackendError, EmbeddingBackend};
use batchembed_store::{consolidated_sources, LedgerMeta, ProgressLedger, ShardWriter, StoreError};

use crate::error::RunError;
use crate::metrics::{spawn_reporter, Metrics};
use crate::retry::{ErrorWindow, NextStep, RetryPolicy};

/// Outcome of one run. `failed` chunks have no marker and are picked up by
/// the next run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub planned: u64,
    pub completed: u64,
    pub skipped_done: u64,
    pub failed: Vec<ChunkId>,
    pub records: u64,
    /// Stopped by an operator signal before the input was exhausted.
    pub aborted: bool,
}

impl RunSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && !self.aborted
    }
}

/// Why a single chunk could not be completed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChunkFailure {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: BackendError },

    #[error("{0}")]
    Permanent(BackendError),
}

enum ChunkOutcome {
    Done { records: u64 },
    Failed(ChunkId),
}

#[derive(Default)]
struct WorkerTally {
    completed: u64,
    failed: Vec<ChunkId>,
    records: u64,
}

pub struct Dispatcher {
    pipeline: PipelineSettings,
    backend_settings: BackendSettings,
    backend: Arc<dyn EmbeddingBackend>,
    balancer: Arc<Balancer>,
    metrics: Arc<Metrics>,
    only: Option<BTreeSet<ChunkId>>,
    consolidated_dir: Option<PathBuf>,
}

impl Dispatcher {
    pub fn new(
        pipeline: PipelineSettings,
        backend_settings: BackendSettings,
        backend: Arc<dyn EmbeddingBackend>,
    ) -> Result<Self, RunError> {
        pipeline.validate()?;
        backend_settings.validate()?;
        let balancer = Arc::new(Balancer::new(&backend_settings.endpoints, backend_settings.policy)?);
        Ok(Self {
            pipeline,
            backend_settings,
            backend,
            balancer,
            metrics: Arc::new(Metrics::new()),
            only: None,
            consolidated_dir: None,
        })
    }

    /// Only plan the given chunk ids (targeted re-run of failures).
    pub fn with_only(mut self, ids: BTreeSet<ChunkId>) -> Self {
        self.only = Some(ids);
        self
    }

    /// Shards merged into the output at `dir` count as present when checking
    /// done chunks against the shard directory.
    pub fn with_consolidated_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.consolidated_dir = Some(dir.into());
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn balancer(&self) -> Arc<Balancer> {
        self.balancer.clone()
    }

    pub fn ledger_meta(&self) -> LedgerMeta {
        ledger_meta(&self.pipeline, &self.backend_settings)
    }

    /// Process every pending chunk. Flipping `shutdown` to `true` stops new
    /// chunks from being taken; in-flight ones finish.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<RunSummary, RunError> {
        let p = &self.pipeline;
        let ledger = ProgressLedger::open(&p.progress_dir, self.ledger_meta())?;
        let writer =
            ShardWriter::new(&p.shard_dir, &self.backend_settings.model_id, self.backend_settings.output_dim())?;
        writer.cleanup_staging()?;
        if p.verify_shards {
            let consolidated = match &self.consolidated_dir {
                Some(dir) => consolidated_sources(dir)?,
                None => HashSet::new(),
            };
            let missing = ledger.check_integrity(&p.shard_dir, &consolidated);
            if let Some(first) = missing.first() {
                return Err(StoreError::Integrity(format!(
                    "{} done chunks have no shard in {} (first: {first})",
                    missing.len(),
                    p.shard_dir.display()
                ))
                .into());
            }
        }
        let done = ledger.all_done_ids();
        info!(
            input = %p.input_file.display(),
            already_done = done.len(),
            concurrency = p.concurrency,
            endpoints = self.balancer.len(),
            policy = ?self.balancer.policy(),
            "starting run"
        );

        let halt = Arc::new(watch::channel(false).0);
        let interrupted = Arc::new(AtomicBool::new(false));
        let forwarder = {
            let halt = halt.clone();
            let interrupted = interrupted.clone();
            let mut shutdown = shutdown;
            tokio::spawn(async move {
                triggered(&mut shutdown).await;
                interrupted.store(true, Ordering::SeqCst);
                warn!("shutdown requested; finishing in-flight chunks");
                halt.send_replace(true);
            })
        };

        let (tx, rx) = mpsc::channel::<Chunk>(p.concurrency);
        let planner = self.spawn_planner(tx, done, halt.subscribe());

        let shared = Arc::new(Shared {
            model_id: self.backend_settings.model_id.clone(),
            dim: self.backend_settings.dim,
            truncate_dim: self.backend_settings.truncate_dim,
            request_batch_size: p.request_batch_size,
            backend: self.backend.clone(),
            balancer: self.balancer.clone(),
            metrics: self.metrics.clone(),
            retry: RetryPolicy::from_settings(p),
            window: Mutex::new(ErrorWindow::new(p.error_window, p.max_error_rate)),
            writer,
            ledger: Arc::new(Mutex::new(ledger)),
            halt: halt.clone(),
        });

        let (stop_reporter, reporter_rx) = watch::channel(false);
        let reporter = spawn_reporter(
            self.metrics.clone(),
            self.balancer.clone(),
            Duration::from_secs(p.report_interval_secs),
            reporter_rx,
        );

        let rx = Arc::new(AsyncMutex::new(rx));
        let workers: Vec<_> = (0..p.concurrency)
            .map(|id| tokio::spawn(worker_loop(id, shared.clone(), rx.clone(), halt.subscribe())))
            .collect();
        drop(rx);

        let mut summary = RunSummary::default();
        let mut first_err: Option<RunError> = None;
        for handle in workers {
            match handle.await {
                Ok((tally, err)) => {
                    summary.completed += tally.completed;
                    summary.records += tally.records;
                    summary.failed.extend(tally.failed);
                    if let Some(e) = err {
                        first_err.get_or_insert(e);
                    }
                }
                Err(join) => {
                    first_err.get_or_insert(join.into());
                }
            }
        }
        let plan = planner.await;

        stop_reporter.send_replace(true);
        let _ = reporter.await;
        forwarder.abort();

        if let Some(e) = first_err {
            error!(error = %e, "run aborted");
            return Err(e);
        }
        let stats: PlanStats = plan??;

        summary.failed.sort_unstable();
        summary.planned = self.metrics.snapshot().chunks_planned;
        summary.skipped_done = stats.skipped_done;
        summary.aborted = interrupted.load(Ordering::SeqCst);
        info!(
            planned = summary.planned,
            completed = summary.completed,
            skipped_done = summary.skipped_done,
            failed = summary.failed.len(),
            records = summary.records,
            aborted = summary.aborted,
            "run finished"
        );
        if !summary.failed.is_empty() {
            warn!(chunks = ?summary.failed, "chunks failed; re-run to retry them");
        }
        Ok(summary)
    }

    fn spawn_planner(
        &self,
        tx: mpsc::Sender<Chunk>,
        done: BTreeSet<ChunkId>,
        halt: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<Result<PlanStats, RunError>> {
        let input = self.pipeline.input_file.clone();
        let chunk_size = self.pipeline.chunk_size;
        let cleaner_chars = self.pipeline.clean_text.then_some(self.pipeline.max_text_chars);
        let only = self.only.clone();
        let metrics = self.metrics.clone();
        tokio::task::spawn_blocking(move || -> Result<PlanStats, RunError> {
            let cleaner = cleaner_chars.map(TextCleaner::new).transpose()?;
            let source = RecordSource::open(&input, cleaner)?;
            let mut planner = ChunkPlanner::new(source, chunk_size, done)?;
            if let Some(only) = only {
                planner = planner.with_only(only);
            }
            for chunk in planner.by_ref() {
                let chunk = chunk?;
                if *halt.borrow() || tx.blocking_send(chunk).is_err() {
                    debug!("planner stopped early");
                    break;
                }
                metrics.chunk_planned();
            }
            Ok(planner.stats())
        })
    }
}

pub fn ledger_meta(pipeline: &PipelineSettings, backend: &BackendSettings) -> LedgerMeta {
    LedgerMeta {
        chunk_size: pipeline.chunk_size,
        model_id: backend.model_id.clone(),
        dim: backend.output_dim(),
        input: pipeline
            .input_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    }
}

/// Resolves once `rx` reads `true`. A dropped sender never triggers.
async fn triggered(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn worker_loop(
    id: usize,
    shared: Arc<Shared>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Chunk>>>,
    mut halt: watch::Receiver<bool>,
) -> (WorkerTally, Option<RunError>) {
    let mut tally = WorkerTally::default();
    loop {
        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                chunk = rx.recv() => chunk,
                _ = triggered(&mut halt) => None,
            }
        };
        let Some(chunk) = next else { break };
        if *halt.borrow() {
            break;
        }
        match shared.process(chunk).await {
            Ok(ChunkOutcome::Done { records }) => {
                tally.completed += 1;
                tally.records += records;
            }
            Ok(ChunkOutcome::Failed(chunk_id)) => tally.failed.push(chunk_id),
            Err(e) => {
                shared.halt.send_replace(true);
                return (tally, Some(e));
            }
        }
    }
    debug!(worker = id, "worker exiting");
    (tally, None)
}

struct Shared {
    model_id: String,
    dim: usize,
    truncate_dim: Option<usize>,
    request_batch_size: Option<usize>,
    backend: Arc<dyn EmbeddingBackend>,
    balancer: Arc<Balancer>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    window: Mutex<ErrorWindow>,
    writer: ShardWriter,
    ledger: Arc<Mutex<ProgressLedger>>,
    halt: Arc<watch::Sender<bool>>,
}

impl Shared {
    async fn process(&self, mut chunk: Chunk) -> Result<ChunkOutcome, RunError> {
        let chunk_id = chunk.chunk_id;
        chunk.transition(ChunkStatus::InFlight)?;
        self.metrics.chunk_started();
        let vectors = match self.embed_chunk(&chunk).await {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(failure)) => {
                chunk.transition(ChunkStatus::Failed)?;
                self.metrics.chunk_finished(0, false);
                warn!(chunk_id, error = %failure, "chunk failed");
                return Ok(ChunkOutcome::Failed(chunk_id));
            }
            Err(e) => {
                self.metrics.chunk_finished(0, false);
                return Err(e);
            }
        };
        let records = chunk.records.len() as u64;
        let results: Vec<EmbeddingResult> = chunk
            .records
            .iter()
            .zip(vectors)
            .map(|(r, vector)| EmbeddingResult { id: r.id.clone(), vector, model_id: self.model_id.clone() })
            .collect();
        self.persist(chunk_id, results).await?;
        chunk.transition(ChunkStatus::Done)?;
        self.metrics.chunk_finished(records, true);
        debug!(chunk_id, records, "chunk done");
        Ok(ChunkOutcome::Done { records })
    }

    /// Vectors for every record of the chunk in input order.
    async fn embed_chunk(&self, chunk: &Chunk) -> Result<Result<Vec<Vec<f32>>, ChunkFailure>, RunError> {
        let texts = chunk.texts();
        let batch_size = self.request_batch_size.unwrap_or(texts.len()).max(1);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(batch_size) {
            match self.embed_batch(batch).await? {
                Ok(vectors) => out.extend(vectors),
                Err(failure) => return Ok(Err(failure)),
            }
        }
        Ok(Ok(out))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Result<Vec<Vec<f32>>, ChunkFailure>, RunError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let lease = self.balancer.acquire();
            let started = Instant::now();
            let outcome = match self.backend.embed(lease.url(), texts).await {
                Ok(raw) => validate_vectors(lease.url(), raw, texts.len(), self.dim, self.truncate_dim),
                Err(e) => Err(e),
            };
            self.metrics.record_request(started.elapsed(), outcome.is_ok());
            self.record_outcome(outcome.is_ok())?;
            let err = match outcome {
                Ok(vectors) => return Ok(Ok(vectors)),
                Err(err) => err,
            };
            lease.record_failure();
            drop(lease);
            match self.retry.after_failure(attempt, &err) {
                NextStep::RetryAfter(delay) => {
                    debug!(attempt, endpoint = err.endpoint(), error = %err, ?delay, "retrying request");
                    tokio::time::sleep(delay).await;
                }
                NextStep::GiveUp if err.is_transient() => {
                    return Ok(Err(ChunkFailure::Exhausted { attempts: attempt, last: err }));
                }
                NextStep::GiveUp => return Ok(Err(ChunkFailure::Permanent(err))),
            }
        }
    }

    fn record_outcome(&self, ok: bool) -> Result<(), RunError> {
        let mut window = self.window.lock().map_err(|_| RunError::Poisoned("error window"))?;
        if let Some(rate) = window.record(ok) {
            let (capacity, limit) = (window.capacity(), window.max_rate());
            drop(window);
            self.halt.send_replace(true);
            return Err(RunError::ErrorRateExceeded { rate, window: capacity, limit });
        }
        Ok(())
    }

    /// Shard first, marker second, both off the async threads.
    async fn persist(&self, chunk_id: ChunkId, results: Vec<EmbeddingResult>) -> Result<(), RunError> {
        let writer = self.writer.clone();
        let ledger = self.ledger.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RunError> {
            let records = results.len() as u64;
            let shard = if results.is_empty() { String::new() } else { writer.write_chunk(chunk_id, &results)? };
            let mut ledger = ledger.lock().map_err(|_| RunError::Poisoned("progress ledger"))?;
            ledger.mark_done(ProgressMarker::now(chunk_id, shard, records))?;
            Ok(())
        })
        .await?
    }
}
