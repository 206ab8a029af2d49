use std::future::Future;
use std::pin::Pin;

use crate::error::BackendError;

pub type EmbedFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Vec<f32>>, BackendError>> + Send + 'a>>;

/// A capability that turns a batch of texts into vectors, one per input and
/// in input order.
///
/// `endpoint` is picked by the caller's balancer, so a single backend value
/// can serve a whole pool of fungible endpoints.
pub trait EmbeddingBackend: Send + Sync {
    fn embed<'a>(&'a self, endpoint: &'a str, texts: &'a [String]) -> EmbedFuture<'a>;
}
