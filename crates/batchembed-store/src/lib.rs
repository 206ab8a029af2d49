#![deny(warnings)]
#![deny(dead_code)]
#![deny(unused_variables)]
#![deny(unused_imports)]

//! Durable output tier: Parquet shards, the progress ledger and the
//! consolidation pass.

pub mod consolidate;
pub mod error;
pub mod fsio;
pub mod ledger;
pub mod schema;
pub mod shard;
pub mod verify;

pub use consolidate::{consolidated_sources, ConsolidateReport, Consolidator, Manifest};
pub use error::{Result, StoreError};
pub use ledger::{LedgerMeta, ProgressLedger};
pub use shard::{list_shards, read_shard, ShardContents, ShardRef, ShardRow, ShardWriter};
