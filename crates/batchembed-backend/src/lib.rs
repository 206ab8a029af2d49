//! Embedding backends and the endpoint pool in front of them.
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use batchembed_core::config::BackendSettings;
use batchembed_core::{EmbeddingBackend, Result};

pub mod balancer;
pub mod fake;
pub mod http;
pub mod vectors;

pub use balancer::{Balancer, EndpointStats, Lease};
pub use fake::FakeBackend;
pub use http::HttpBackend;

/// Build the backend for a run.
///
/// Respects `APP_USE_FAKE_EMBEDDINGS=1` to swap in [`FakeBackend`] for fast,
/// deterministic dry runs without any server.
pub fn get_default_backend(settings: &BackendSettings, concurrency: usize) -> Result<Arc<dyn EmbeddingBackend>> {
    let use_fake = std::env::var("APP_USE_FAKE_EMBEDDINGS")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if use_fake {
        info!(dim = settings.dim, "using fake embedding backend");
        return Ok(Arc::new(FakeBackend::new(settings.dim)));
    }
    let per_host = concurrency.div_ceil(settings.endpoints.len().max(1)).max(1);
    let timeout = Duration::from_secs(settings.request_timeout_secs);
    let backend = HttpBackend::new(timeout, settings.truncate_inputs, per_host)?;
    info!(
        endpoints = settings.endpoints.len(),
        timeout_secs = settings.request_timeout_secs,
        "using HTTP embedding backend"
    );
    Ok(Arc::new(backend))
}
