//! Throughput and latency counters plus the periodic log reporter.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use batchembed_backend::Balancer;

const LATENCY_WINDOW: usize = 2000;

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    docs: AtomicU64,
    requests: AtomicU64,
    request_errors: AtomicU64,
    chunks_planned: AtomicU64,
    chunks_done: AtomicU64,
    chunks_failed: AtomicU64,
    in_flight: AtomicUsize,
    latencies_ms: Mutex<VecDeque<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub elapsed: Duration,
    pub docs: u64,
    pub requests: u64,
    pub request_errors: u64,
    pub chunks_planned: u64,
    pub chunks_done: u64,
    pub chunks_failed: u64,
    pub in_flight: usize,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            docs: AtomicU64::new(0),
            requests: AtomicU64::new(0),
            request_errors: AtomicU64::new(0),
            chunks_planned: AtomicU64::new(0),
            chunks_done: AtomicU64::new(0),
            chunks_failed: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    pub fn record_request(&self, latency: Duration, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.request_errors.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut lat) = self.latencies_ms.lock() {
            if lat.len() == LATENCY_WINDOW {
                lat.pop_front();
            }
            lat.push_back(latency.as_secs_f64() * 1000.0);
        }
    }

    pub fn chunk_planned(&self) {
        self.chunks_planned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_finished(&self, records: u64, done: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if done {
            self.docs.fetch_add(records, Ordering::Relaxed);
            self.chunks_done.fetch_add(1, Ordering::Relaxed);
        } else {
            self.chunks_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut window: Vec<f64> = self.latencies_ms.lock().map(|l| l.iter().copied().collect()).unwrap_or_default();
        window.sort_by(f64::total_cmp);
        MetricsSnapshot {
            elapsed: self.started.elapsed(),
            docs: self.docs.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            chunks_planned: self.chunks_planned.load(Ordering::Relaxed),
            chunks_done: self.chunks_done.load(Ordering::Relaxed),
            chunks_failed: self.chunks_failed.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            p50_ms: percentile(&window, 50.0),
            p95_ms: percentile(&window, 95.0),
        }
    }
}

/// Linear-interpolated percentile of an ascending slice; 0 when empty.
pub fn percentile(sorted: &[f64], pct: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (pct / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Log a throughput line every `interval` until `stop` flips, then a final one.
pub fn spawn_reporter(
    metrics: Arc<Metrics>,
    balancer: Arc<Balancer>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.tick().await;
        let mut last_docs = 0u64;
        let mut last_at = Instant::now();
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let snap = metrics.snapshot();
            let now = Instant::now();
            let inst = (snap.docs - last_docs) as f64 / now.duration_since(last_at).as_secs_f64().max(1e-6);
            let avg = snap.docs as f64 / snap.elapsed.as_secs_f64().max(1e-6);
            let per_endpoint: Vec<String> =
                balancer.snapshot().iter().map(|e| format!("{}={}", e.url, e.requests)).collect();
            info!(
                elapsed_s = snap.elapsed.as_secs(),
                inst_docs_s = inst.round(),
                avg_docs_s = avg.round(),
                docs = snap.docs,
                requests = snap.requests,
                errors = snap.request_errors,
                in_flight = snap.in_flight,
                p50_ms = round1(snap.p50_ms),
                p95_ms = round1(snap.p95_ms),
                endpoints = %per_endpoint.join(","),
                "progress"
            );
            last_docs = snap.docs;
            last_at = now;
        }
        let snap = metrics.snapshot();
        info!(
            elapsed_s = snap.elapsed.as_secs(),
            docs = snap.docs,
            chunks_done = snap.chunks_done,
            chunks_failed = snap.chunks_failed,
            requests = snap.requests,
            errors = snap.request_errors,
            p50_ms = round1(snap.p50_ms),
            p95_ms = round1(snap.p95_ms),
            "final throughput"
        );
    })
}
