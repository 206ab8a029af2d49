use thiserror::Error;

use batchembed_store::StoreError;

/// Run-level failures. Per-chunk backend errors never surface here; they
/// end up in [`crate::RunSummary::failed`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Core(#[from] batchembed_core::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("error rate {rate:.2} over the last {window} requests exceeds {limit:.2}; aborting")]
    ErrorRateExceeded { rate: f64, window: usize, limit: f64 },

    #[error("{0} lock poisoned")]
    Poisoned(&'static str),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl RunError {
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Core(batchembed_core::Error::Integrity(_)) => true,
            Self::Store(e) => e.is_integrity(),
            _ => false,
        }
    }
}
