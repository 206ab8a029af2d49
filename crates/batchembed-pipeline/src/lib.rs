#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

pub mod bench;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod retry;

pub use dispatcher::{ledger_meta, ChunkFailure, Dispatcher, RunSummary};
pub use error::RunError;
pub use metrics::{Metrics, MetricsSnapshot};
