//! HTTP client for text-embeddings servers.
//!
//! Sends `{"inputs": [...], "truncate": bool}` and expects an array of
//! vectors in input order.
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use batchembed_core::traits::{EmbedFuture, EmbeddingBackend};
use batchembed_core::{BackendError, Error, Result};

use crate::vectors::decode_vectors;

#[derive(Serialize)]
struct EmbedRequest<'a> {
    inputs: &'a [String],
    truncate: bool,
}

#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    truncate: bool,
}

impl HttpBackend {
    pub fn new(timeout: Duration, truncate: bool, max_idle_per_host: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client build: {e}")))?;
        Ok(Self { client, truncate })
    }

    fn classify_status(endpoint: &str, status: StatusCode, body: &str) -> BackendError {
        let snippet: String = body.chars().take(200).collect();
        let message = format!("status {status}: {snippet}");
        let retryable = matches!(status, StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT);
        if status.is_server_error() || retryable {
            BackendError::transient(endpoint, message)
        } else {
            BackendError::permanent(endpoint, message)
        }
    }

    fn classify_transport(endpoint: &str, err: &reqwest::Error) -> BackendError {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            BackendError::transient(endpoint, err.to_string())
        } else {
            BackendError::permanent(endpoint, err.to_string())
        }
    }

    async fn post(&self, endpoint: &str, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, BackendError> {
        let request = EmbedRequest { inputs: texts, truncate: self.truncate };
        let resp = self
            .client
            .post(endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| Self::classify_transport(endpoint, &e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<body unavailable>".into());
            return Err(Self::classify_status(endpoint, status, &body));
        }
        let bytes = resp.bytes().await.map_err(|e| Self::classify_transport(endpoint, &e))?;
        let body: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::permanent(endpoint, format!("invalid JSON body: {e}")))?;
        let vectors = decode_vectors(endpoint, body)?;
        debug!(endpoint, inputs = texts.len(), "embedding request ok");
        Ok(vectors)
    }
}

impl EmbeddingBackend for HttpBackend {
    fn embed<'a>(&'a self, endpoint: &'a str, texts: &'a [String]) -> EmbedFuture<'a> {
        Box::pin(self.post(endpoint, texts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let t = HttpBackend::classify_status("e", StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(t.is_transient());
        let t = HttpBackend::classify_status("e", StatusCode::TOO_MANY_REQUESTS, "");
        assert!(t.is_transient());
        let p = HttpBackend::classify_status("e", StatusCode::UNPROCESSABLE_ENTITY, "input too long");
        assert!(!p.is_transient());
        assert!(p.to_string().contains("input too long"));
    }
}
