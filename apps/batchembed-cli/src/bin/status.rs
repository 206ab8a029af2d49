use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use batchembed_cli::{count_lines, init_tracing, ConfigArgs};
use batchembed_store::{consolidated_sources, list_shards, ProgressLedger};

#[derive(Parser, Debug)]
#[command(name = "batchembed-status", about = "Summarize ledger progress and check shards against it")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Skip counting input lines
    #[arg(long)]
    no_input_scan: bool,

    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let settings = cli.config.load()?;
    let p = settings.pipeline;

    let ledger = ProgressLedger::open_existing(&p.progress_dir)
        .with_context(|| format!("no ledger in {}; has a run started?", p.progress_dir.display()))?;
    let meta = ledger.meta().clone();
    let consolidated = consolidated_sources(&settings.consolidate.output_dir)?;
    let missing = ledger.check_integrity(&p.shard_dir, &consolidated);
    let shards = list_shards(&p.shard_dir)?.len();
    let total_chunks = if cli.no_input_scan || !p.input_file.exists() {
        None
    } else {
        Some(count_lines(&p.input_file, true)?.div_ceil(meta.chunk_size as u64))
    };

    if cli.json {
        let out = serde_json::json!({
            "chunk_size": meta.chunk_size,
            "model_id": meta.model_id,
            "dim": meta.dim,
            "done_chunks": ledger.len(),
            "done_records": ledger.done_records(),
            "total_chunks": total_chunks,
            "shards": shards,
            "consolidated_shards": consolidated.len(),
            "missing_shards": missing,
        });
        println!("{out}");
    } else {
        println!("ledger:   {}", p.progress_dir.display());
        println!("model:    {} (dim {}), chunk size {}", meta.model_id, meta.dim, meta.chunk_size);
        match total_chunks {
            Some(total) if total > 0 => println!(
                "done:     {}/{} chunks ({:.1}%), {} records",
                ledger.len(),
                total,
                ledger.len() as f64 * 100.0 / total as f64,
                ledger.done_records()
            ),
            _ => println!("done:     {} chunks, {} records", ledger.len(), ledger.done_records()),
        }
        println!("shards:   {} in {}", shards, p.shard_dir.display());
        if !consolidated.is_empty() {
            println!("merged:   {} shards in {}", consolidated.len(), settings.consolidate.output_dir.display());
        }
        if !missing.is_empty() {
            println!("MISSING:  {} done chunks have no shard: {:?}", missing.len(), missing);
        }
    }
    Ok(if missing.is_empty() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
