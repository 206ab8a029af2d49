use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use batchembed_backend::get_default_backend;
use batchembed_cli::{init_tracing, shutdown_on_ctrl_c, BackendArgs, ConfigArgs};
use batchembed_pipeline::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "batchembed-run", about = "Embed a JSONL corpus into Parquet shards, resuming from the ledger")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    backend: BackendArgs,

    /// JSONL input with `_id` and `text` per line
    #[arg(long)]
    input: Option<PathBuf>,

    #[arg(long)]
    shard_dir: Option<PathBuf>,

    #[arg(long)]
    progress_dir: Option<PathBuf>,

    #[arg(long)]
    chunk_size: Option<usize>,

    /// Concurrent chunk workers
    #[arg(long)]
    concurrency: Option<usize>,

    /// Texts per request; whole chunk when unset
    #[arg(long)]
    request_batch_size: Option<usize>,

    #[arg(long)]
    max_attempts: Option<u32>,

    /// Start even if some done chunks have lost their shards
    #[arg(long)]
    skip_shard_check: bool,

    /// Normalize text before embedding
    #[arg(long)]
    clean_text: bool,

    /// Only process these chunk ids
    #[arg(long, value_delimiter = ',')]
    only: Vec<u64>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let mut settings = cli.config.load()?;
    cli.backend.apply(&mut settings.backend)?;

    let p = &mut settings.pipeline;
    if let Some(v) = cli.input {
        p.input_file = v;
    }
    if let Some(v) = cli.shard_dir {
        p.shard_dir = v;
    }
    if let Some(v) = cli.progress_dir {
        p.progress_dir = v;
    }
    if let Some(v) = cli.chunk_size {
        p.chunk_size = v;
    }
    if let Some(v) = cli.concurrency {
        p.concurrency = v;
    }
    if cli.request_batch_size.is_some() {
        p.request_batch_size = cli.request_batch_size;
    }
    if let Some(v) = cli.max_attempts {
        p.max_attempts = v;
    }
    p.verify_shards &= !cli.skip_shard_check;
    p.clean_text |= cli.clean_text;

    let backend = get_default_backend(&settings.backend, settings.pipeline.concurrency)?;
    let mut dispatcher = Dispatcher::new(settings.pipeline.clone(), settings.backend.clone(), backend)
        .context("invalid run configuration")?
        .with_consolidated_dir(&settings.consolidate.output_dir);
    if !cli.only.is_empty() {
        dispatcher = dispatcher.with_only(cli.only.into_iter().collect());
    }

    let summary = dispatcher.run(shutdown_on_ctrl_c()).await?;
    println!(
        "planned {} | completed {} | skipped {} | failed {} | records {}",
        summary.planned,
        summary.completed,
        summary.skipped_done,
        summary.failed.len(),
        summary.records
    );
    if !summary.failed.is_empty() {
        let ids: Vec<String> = summary.failed.iter().map(u64::to_string).collect();
        error!(chunks = %ids.join(","), "failed chunks remain");
        println!("re-run, or target them with --only {}", ids.join(","));
        return Ok(ExitCode::FAILURE);
    }
    if summary.aborted {
        info!("stopped early; re-run to continue");
        return Ok(ExitCode::from(130));
    }
    println!("all chunks done; next: batchembed-consolidate");
    Ok(ExitCode::SUCCESS)
}
