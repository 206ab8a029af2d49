//! Deterministic in-process backend for tests, demos and dry runs.
//!
//! Vectors are a hashed bag of whitespace tokens, L2-normalized, so the same
//! text always yields the same vector on every endpoint. Faults and latency
//! can be injected per request.
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use twox_hash::XxHash64;

use batchembed_core::traits::{EmbedFuture, EmbeddingBackend};
use batchembed_core::BackendError;

pub type FaultFn = dyn Fn(&str, &[String]) -> Option<BackendError> + Send + Sync;

pub fn fake_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0f32; dim];
    for (i, token) in text.split_whitespace().enumerate() {
        let mut hasher = XxHash64::with_seed(0);
        token.hash(&mut hasher);
        let h = hasher.finish();
        let idx = (h as usize) % dim;
        let val = (((h >> 32) as u32) as f32) / (u32::MAX as f32);
        v[idx] += val + (i as f32 % 3.0) * 0.01;
    }
    let norm = (v.iter().map(|x| x * x).sum::<f32>()).sqrt().max(1e-6);
    for x in &mut v {
        *x /= norm;
    }
    v
}

#[derive(Clone)]
pub struct FakeBackend {
    dim: usize,
    latency: Duration,
    fault: Option<Arc<FaultFn>>,
    calls: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<(String, Vec<String>)>>>,
}

impl FakeBackend {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            latency: Duration::ZERO,
            fault: None,
            calls: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail any request for which `fault` returns an error.
    pub fn with_fault<F>(mut self, fault: F) -> Self
    where
        F: Fn(&str, &[String]) -> Option<BackendError> + Send + Sync + 'static,
    {
        self.fault = Some(Arc::new(fault));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of requests whose batch contained `text`.
    pub fn calls_containing(&self, text: &str) -> usize {
        self.log
            .lock()
            .map(|log| log.iter().filter(|(_, texts)| texts.iter().any(|t| t == text)).count())
            .unwrap_or(0)
    }

    /// Texts seen across all requests, failed ones included.
    pub fn texts_seen(&self) -> Vec<String> {
        self.log
            .lock()
            .map(|log| log.iter().flat_map(|(_, t)| t.iter().cloned()).collect())
            .unwrap_or_default()
    }

    pub fn endpoints_seen(&self) -> Vec<String> {
        self.log.lock().map(|log| log.iter().map(|(e, _)| e.clone()).collect()).unwrap_or_default()
    }

    async fn run(&self, endpoint: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.log.lock() {
            log.push((endpoint.to_string(), texts.to_vec()));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(fault) = &self.fault {
            if let Some(err) = fault(endpoint, texts) {
                return Err(err);
            }
        }
        Ok(texts.iter().map(|t| fake_vector(t, self.dim)).collect())
    }
}

impl EmbeddingBackend for FakeBackend {
    fn embed<'a>(&'a self, endpoint: &'a str, texts: &'a [String]) -> EmbedFuture<'a> {
        Box::pin(self.run(endpoint, texts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn vectors_are_deterministic_and_normalized() {
        let b = FakeBackend::new(16);
        let texts = vec!["hello world".to_string(), "hello world".to_string()];
        let out = b.embed("any", &texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], out[1]);
        let norm: f32 = out[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() <= 1e-3);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn faults_are_injected_and_logged() {
        let b = FakeBackend::new(4).with_fault(|ep, texts| {
            texts.iter().any(|t| t == "bad").then(|| BackendError::transient(ep, "boom"))
        });
        assert!(b.embed("e1", &["ok".to_string()]).await.is_ok());
        let err = b.embed("e2", &["bad".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(b.calls_containing("bad"), 1);
        assert_eq!(b.endpoints_seen(), vec!["e1".to_string(), "e2".to_string()]);
    }
}
