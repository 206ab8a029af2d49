use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use batchembed_backend::{get_default_backend, Balancer};
use batchembed_cli::{init_tracing, BackendArgs, ConfigArgs};
use batchembed_pipeline::bench::{best, run_grid, write_csv, BenchSettings};

#[derive(Parser, Debug)]
#[command(name = "batchembed-bench", about = "Sweep request batch size and concurrency against the endpoint pool")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    backend: BackendArgs,

    /// Synthetic documents per trial
    #[arg(long, default_value_t = 20_000)]
    docs: usize,

    #[arg(long, default_value_t = 48)]
    avg_words: usize,

    #[arg(long, default_value_t = 12)]
    std_words: usize,

    #[arg(long, value_delimiter = ',', default_value = "16,32,64,128")]
    batches: Vec<usize>,

    #[arg(long, value_delimiter = ',', default_value = "8,16,32,64")]
    concurrencies: Vec<usize>,

    #[arg(long, default_value_t = 2000.0)]
    p95_target_ms: f64,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Write every trial to this CSV file
    #[arg(long)]
    csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut backend_settings = cli.config.load()?.backend;
    cli.backend.apply(&mut backend_settings)?;
    anyhow::ensure!(!cli.batches.is_empty() && !cli.concurrencies.is_empty(), "empty grid");

    let settings = BenchSettings {
        docs: cli.docs,
        avg_words: cli.avg_words,
        std_words: cli.std_words,
        batches: cli.batches,
        concurrencies: cli.concurrencies,
        p95_target_ms: cli.p95_target_ms,
        seed: cli.seed,
        dim: backend_settings.dim,
    };
    let max_conc = settings.concurrencies.iter().copied().max().unwrap_or(1);
    let backend = get_default_backend(&backend_settings, max_conc)?;
    let balancer = Balancer::new(&backend_settings.endpoints, backend_settings.policy)?;

    let results = run_grid(backend, &balancer, &settings).await;
    println!("{:>6} {:>6} {:>10} {:>9} {:>9} {:>7}", "batch", "conc", "docs/s", "p50 ms", "p95 ms", "errors");
    for r in &results {
        println!(
            "{:>6} {:>6} {:>10.1} {:>9.1} {:>9.1} {:>7}",
            r.batch, r.concurrency, r.docs_per_sec, r.p50_ms, r.p95_ms, r.errors
        );
    }
    match best(&results, settings.p95_target_ms) {
        Some(b) => println!(
            "best: request_batch_size={} concurrency={} ({:.1} docs/s, p95 {:.0} ms)",
            b.batch, b.concurrency, b.docs_per_sec, b.p95_ms
        ),
        None => println!("no combination met p95 <= {} ms without errors", settings.p95_target_ms),
    }
    if let Some(path) = &cli.csv {
        write_csv(path, &results).with_context(|| format!("writing {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}
