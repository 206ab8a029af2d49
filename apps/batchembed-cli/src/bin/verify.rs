use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use batchembed_cli::init_tracing;
use batchembed_store::consolidate::MANIFEST_FILE;
use batchembed_store::verify::{inspect_file, verify_consolidated, FileReport};

#[derive(Parser, Debug)]
#[command(name = "batchembed-verify", about = "Inspect a Parquet file or check a consolidated directory")]
struct Cli {
    /// A shard/part file, or a consolidated directory
    path: PathBuf,

    /// Count repeated ids (single file mode)
    #[arg(long)]
    check_duplicates: bool,

    /// Print the Arrow schema
    #[arg(long)]
    schema: bool,
}

fn print_file(r: &FileReport, show_schema: bool) {
    println!(
        "{}: {} rows, {} row groups, model {}, dim {}",
        r.path.display(),
        r.rows,
        r.row_groups,
        r.model_id.as_deref().unwrap_or("?"),
        r.dim.map(|d| d.to_string()).unwrap_or_else(|| "?".into())
    );
    if let Some(d) = r.duplicate_ids {
        println!("  duplicate ids: {d}");
    }
    if show_schema {
        println!("  schema: {}", r.schema);
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    if cli.path.is_dir() {
        anyhow::ensure!(
            cli.path.join(MANIFEST_FILE).exists(),
            "{} has no {MANIFEST_FILE}; not a consolidated directory",
            cli.path.display()
        );
        let report = verify_consolidated(&cli.path).with_context(|| format!("verifying {}", cli.path.display()))?;
        for part in &report.parts {
            print_file(part, cli.schema);
        }
        println!("OK: {} parts, {} records, no duplicate ids", report.parts.len(), report.total_records);
        return Ok(ExitCode::SUCCESS);
    }

    let report = inspect_file(&cli.path, cli.check_duplicates)?;
    print_file(&report, cli.schema);
    Ok(match report.duplicate_ids {
        Some(d) if d > 0 => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}
