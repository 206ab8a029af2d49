use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use batchembed_cli::{completed_chunks, init_tracing, ConfigArgs};
use batchembed_store::Consolidator;

#[derive(Parser, Debug)]
#[command(name = "batchembed-consolidate", about = "Merge shards into large row-grouped Parquet parts")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[arg(long)]
    shard_dir: Option<PathBuf>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    max_records_per_file: Option<usize>,

    #[arg(long)]
    row_group_size: Option<usize>,

    /// Remove source shards once parts and manifest are durable
    #[arg(long)]
    delete_sources: bool,

    /// Merge the chunks that are done even though the run has pending ones
    #[arg(long)]
    allow_incomplete: bool,

    #[arg(long)]
    no_progress: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = cli.config.load()?;
    let mut c = settings.consolidate;
    if let Some(v) = cli.shard_dir {
        c.shard_dir = v;
    }
    if let Some(v) = cli.output_dir {
        c.output_dir = v;
    }
    if let Some(v) = cli.max_records_per_file {
        c.max_records_per_file = v;
    }
    if let Some(v) = cli.row_group_size {
        c.row_group_size = v;
    }
    c.delete_sources |= cli.delete_sources;

    let done = completed_chunks(&settings.pipeline, cli.allow_incomplete, !cli.no_progress)?;
    let (shard_dir, output_dir) = (c.shard_dir.clone(), c.output_dir.clone());
    let report = Consolidator::new(c)?
        .with_progress(!cli.no_progress)
        .with_done(done)
        .run()
        .with_context(|| format!("consolidating {} into {}", shard_dir.display(), output_dir.display()))?;

    if report.skipped_unmarked > 0 {
        println!("left {} shards without ledger markers in place", report.skipped_unmarked);
    }
    if report.shards == 0 {
        println!("no new shards in {}; {} parts unchanged", shard_dir.display(), report.parts);
        return Ok(());
    }
    println!(
        "{} shards -> {} parts ({} kept from earlier runs), {} records in {}",
        report.shards,
        report.parts,
        report.carried_parts,
        report.records,
        output_dir.display()
    );
    if report.stale_parts_removed > 0 {
        println!("removed {} stale parts", report.stale_parts_removed);
    }
    if report.sources_deleted > 0 {
        println!("deleted {} source shards", report.sources_deleted);
    }
    Ok(())
}
