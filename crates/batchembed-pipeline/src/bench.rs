//! Synthetic load generator for sizing `request_batch_size` and
//! `concurrency` against a set of endpoints.
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;

use batchembed_backend::vectors::validate_vectors;
use batchembed_backend::Balancer;
use batchembed_core::EmbeddingBackend;

use crate::error::RunError;
use crate::metrics::percentile;

#[derive(Debug, Clone)]
pub struct BenchSettings {
    pub docs: usize,
    pub avg_words: usize,
    pub std_words: usize,
    pub batches: Vec<usize>,
    pub concurrencies: Vec<usize>,
    pub p95_target_ms: f64,
    pub seed: u64,
    /// Expected vector length; responses of another length count as errors.
    pub dim: usize,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            docs: 20_000,
            avg_words: 48,
            std_words: 12,
            batches: vec![16, 32, 64, 128],
            concurrencies: vec![8, 16, 32, 64],
            p95_target_ms: 2000.0,
            seed: 42,
            dim: 768,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialResult {
    pub batch: usize,
    pub concurrency: usize,
    pub docs: u64,
    pub seconds: f64,
    pub docs_per_sec: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub errors: u64,
}

/// `n` documents of `lorem_NNNN` words, length drawn around `avg ± std`.
pub fn synth_docs(n: usize, avg: usize, std: usize, seed: u64) -> Vec<String> {
    let mut rng = StdRng::seed_from_u64(seed);
    let spread = std as i64;
    (0..n)
        .map(|_| {
            let words = (avg as i64 + rng.gen_range(-spread..=spread)).max(4) as usize;
            (0..words).map(|_| format!("lorem_{}", rng.gen_range(1..=9999))).collect::<Vec<_>>().join(" ")
        })
        .collect()
}

pub async fn run_trial(
    backend: Arc<dyn EmbeddingBackend>,
    balancer: &Balancer,
    docs: &[String],
    batch: usize,
    concurrency: usize,
    dim: usize,
) -> TrialResult {
    let started = Instant::now();
    let outcomes: Vec<(usize, f64, bool)> = stream::iter(docs.chunks(batch.max(1)))
        .map(|texts| {
            let backend = backend.clone();
            async move {
                let lease = balancer.acquire();
                let t0 = Instant::now();
                let ok = match backend.embed(lease.url(), texts).await {
                    Ok(raw) => validate_vectors(lease.url(), raw, texts.len(), dim, None).is_ok(),
                    Err(_) => false,
                };
                if !ok {
                    lease.record_failure();
                }
                (texts.len(), t0.elapsed().as_secs_f64() * 1000.0, ok)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    let seconds = started.elapsed().as_secs_f64();
    let mut latencies: Vec<f64> = outcomes.iter().map(|(_, ms, _)| *ms).collect();
    latencies.sort_by(f64::total_cmp);
    let docs_ok: u64 = outcomes.iter().filter(|(_, _, ok)| *ok).map(|(n, _, _)| *n as u64).sum();
    let errors = outcomes.iter().filter(|(_, _, ok)| !ok).count() as u64;
    TrialResult {
        batch,
        concurrency,
        docs: docs_ok,
        seconds,
        docs_per_sec: docs_ok as f64 / seconds.max(1e-6),
        p50_ms: percentile(&latencies, 50.0),
        p95_ms: percentile(&latencies, 95.0),
        errors,
    }
}

/// Every `(batch, concurrency)` combination over the same document set.
pub async fn run_grid(
    backend: Arc<dyn EmbeddingBackend>,
    balancer: &Balancer,
    settings: &BenchSettings,
) -> Vec<TrialResult> {
    let docs = synth_docs(settings.docs, settings.avg_words, settings.std_words, settings.seed);
    let mut results = Vec::with_capacity(settings.batches.len() * settings.concurrencies.len());
    for &batch in &settings.batches {
        for &concurrency in &settings.concurrencies {
            let r = run_trial(backend.clone(), balancer, &docs, batch, concurrency, settings.dim).await;
            info!(
                batch,
                concurrency,
                docs_s = r.docs_per_sec.round(),
                p50_ms = r.p50_ms.round(),
                p95_ms = r.p95_ms.round(),
                errors = r.errors,
                "trial"
            );
            results.push(r);
        }
    }
    results
}

/// Highest throughput among error-free trials meeting the p95 target.
pub fn best(results: &[TrialResult], p95_target_ms: f64) -> Option<&TrialResult> {
    results
        .iter()
        .filter(|r| r.errors == 0 && r.p95_ms <= p95_target_ms)
        .max_by(|a, b| a.docs_per_sec.total_cmp(&b.docs_per_sec))
}

pub fn write_csv(path: &Path, results: &[TrialResult]) -> Result<(), RunError> {
    let mut w = csv::Writer::from_path(path)?;
    for r in results {
        w.serialize(r)?;
    }
    w.flush().map_err(csv::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use batchembed_backend::FakeBackend;
    use batchembed_core::config::BalancePolicy;
    use batchembed_core::BackendError;

    #[test]
    fn synthetic_docs_are_seeded() {
        let a = synth_docs(20, 10, 3, 7);
        assert_eq!(a, synth_docs(20, 10, 3, 7));
        assert_ne!(a, synth_docs(20, 10, 3, 8));
        for d in &a {
            let words = d.split_whitespace().count();
            assert!((7..=13).contains(&words), "{words}");
        }
    }

    #[tokio::test]
    async fn grid_reports_each_combo_and_picks_best() {
        let backend: Arc<dyn EmbeddingBackend> = Arc::new(FakeBackend::new(8));
        let balancer = Balancer::new(&["a".into(), "b".into()], BalancePolicy::RoundRobin).unwrap();
        let settings = BenchSettings {
            docs: 100,
            batches: vec![10, 25],
            concurrencies: vec![1, 4],
            dim: 8,
            ..BenchSettings::default()
        };
        let results = run_grid(backend, &balancer, &settings).await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.docs == 100 && r.errors == 0));
        assert!(best(&results, f64::MAX).is_some());
        assert!(best(&results, -1.0).is_none());

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bench.csv");
        write_csv(&path, &results).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("batch,concurrency,docs,seconds,docs_per_sec,p50_ms,p95_ms,errors"));
        assert_eq!(text.lines().count(), 5);
    }

    #[tokio::test]
    async fn failures_and_wrong_dims_count_as_errors() {
        let fake = FakeBackend::new(8).with_fault(|ep, _| (ep == "bad").then(|| BackendError::transient(ep, "down")));
        let backend: Arc<dyn EmbeddingBackend> = Arc::new(fake);
        let balancer = Balancer::new(&["ok".into(), "bad".into()], BalancePolicy::RoundRobin).unwrap();
        let docs = synth_docs(40, 5, 1, 1);
        let r = run_trial(backend.clone(), &balancer, &docs, 10, 1, 8).await;
        assert_eq!((r.errors, r.docs), (2, 20));
        let r = run_trial(backend, &balancer, &docs, 10, 1, 16).await;
        assert_eq!(r.docs, 0);
    }
}
