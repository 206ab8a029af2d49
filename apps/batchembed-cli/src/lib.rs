//! Shared plumbing for the operator binaries: logging, layered config with
//! CLI overrides, ledger checks and Ctrl-C handling.
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use batchembed_core::config::{BackendSettings, BalancePolicy, Config, ConsolidateSettings, PipelineSettings};
use batchembed_core::types::ChunkId;
use batchembed_store::ProgressLedger;

/// `RUST_LOG` wins; otherwise `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Directory holding config.toml and config.<env>.toml
    #[arg(long, env = "BATCHEMBED_CONFIG_DIR", default_value = ".")]
    pub config_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub pipeline: PipelineSettings,
    pub backend: BackendSettings,
    pub consolidate: ConsolidateSettings,
}

impl ConfigArgs {
    /// Load every section with paths resolved against the config directory.
    pub fn load(&self) -> Result<Settings> {
        load_settings(&self.config_dir)
    }
}

pub fn load_settings(base: &Path) -> Result<Settings> {
    let config = Config::load_from(base).with_context(|| format!("loading config from {}", base.display()))?;
    let mut pipeline = config.pipeline()?;
    let mut backend = config.backend()?;
    let mut consolidate = config.consolidate()?;
    pipeline.resolve_paths(base);
    consolidate.resolve_paths(base);
    backend.normalize_endpoints();
    Ok(Settings { pipeline, backend, consolidate })
}

#[derive(Args, Debug, Clone, Default)]
pub struct BackendArgs {
    /// Embedding endpoints, comma separated
    #[arg(long, value_delimiter = ',')]
    pub endpoints: Vec<String>,

    #[arg(long)]
    pub model_id: Option<String>,

    /// Vector length the model returns
    #[arg(long)]
    pub dim: Option<usize>,

    /// Keep only the first N components and renormalize
    #[arg(long)]
    pub truncate_dim: Option<usize>,

    /// round_robin or least_outstanding
    #[arg(long)]
    pub policy: Option<String>,

    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl BackendArgs {
    pub fn apply(&self, s: &mut BackendSettings) -> Result<()> {
        if !self.endpoints.is_empty() {
            s.endpoints = self.endpoints.clone();
            s.normalize_endpoints();
        }
        if let Some(m) = &self.model_id {
            s.model_id = m.clone();
        }
        if let Some(d) = self.dim {
            s.dim = d;
        }
        if self.truncate_dim.is_some() {
            s.truncate_dim = self.truncate_dim;
        }
        if let Some(p) = &self.policy {
            s.policy = p.parse::<BalancePolicy>()?;
        }
        if let Some(t) = self.timeout_secs {
            s.request_timeout_secs = t;
        }
        s.validate()?;
        Ok(())
    }
}

/// Number of lines in `path`, counted the way the planner reads them: a
/// trailing line without a newline still counts.
pub fn count_lines(path: &Path, show_progress: bool) -> Result<u64> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let pb = if show_progress {
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} scanning input")
        {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb
    } else {
        ProgressBar::hidden()
    };
    let mut reader = BufReader::with_capacity(1 << 20, file);
    let mut lines = 0u64;
    loop {
        let buf = reader.fill_buf().with_context(|| format!("reading {}", path.display()))?;
        if buf.is_empty() {
            break;
        }
        let n = buf.len();
        lines += buf.iter().filter(|&&b| b == b'\n').count() as u64;
        let ends_without_newline = buf.last() != Some(&b'\n');
        reader.consume(n);
        pb.inc(n as u64);
        if ends_without_newline && reader.fill_buf()?.is_empty() {
            lines += 1;
            break;
        }
    }
    pb.finish_and_clear();
    Ok(lines)
}

/// Done chunk ids from the ledger in `p.progress_dir`, refusing while any
/// chunk of `p.input_file` is still pending unless `allow_incomplete`.
pub fn completed_chunks(
    p: &PipelineSettings,
    allow_incomplete: bool,
    show_progress: bool,
) -> Result<BTreeSet<ChunkId>> {
    let ledger = ProgressLedger::open_existing(&p.progress_dir)
        .with_context(|| format!("no ledger in {}; has a run started?", p.progress_dir.display()))?;
    let done = ledger.all_done_ids();
    let total = count_lines(&p.input_file, show_progress)?.div_ceil(ledger.meta().chunk_size as u64);
    let pending: Vec<ChunkId> = (0..total).filter(|c| !done.contains(c)).collect();
    if let Some(first) = pending.first() {
        if !allow_incomplete {
            bail!(
                "run is incomplete: {} of {total} chunks pending (first: {first}); \
                 finish it with batchembed-run or pass --allow-incomplete",
                pending.len()
            );
        }
        warn!(pending = pending.len(), total, "consolidating an incomplete run");
    }
    Ok(done)
}

/// Flips to `true` on the first Ctrl-C. A second one exits immediately.
pub fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("could not install Ctrl-C handler");
            return;
        }
        info!("Ctrl-C received; draining in-flight chunks (press again to exit now)");
        tx.send_replace(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    use batchembed_core::types::ProgressMarker;
    use batchembed_store::LedgerMeta;

    #[test]
    fn config_paths_resolve_against_config_dir() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            concat!(
                "[pipeline]\ninput_file = \"in.jsonl\"\nchunk_size = 50\n\n",
                "[backend]\nendpoints = [\"http://a/embed, http://b/embed\"]\ndim = 4\n",
            ),
        )
        .unwrap();
        let s = load_settings(tmp.path()).unwrap();
        assert_eq!(s.pipeline.input_file, tmp.path().join("in.jsonl"));
        assert_eq!(s.pipeline.chunk_size, 50);
        assert_eq!(s.backend.endpoints, vec!["http://a/embed", "http://b/embed"]);
        assert_eq!(s.consolidate.output_dir, tmp.path().join("data/consolidated"));
    }

    fn ledger_with(root: &Path, lines: usize, done: &[ChunkId]) -> PipelineSettings {
        let p = PipelineSettings {
            input_file: root.join("input.jsonl"),
            shard_dir: root.join("shards"),
            progress_dir: root.join("progress"),
            chunk_size: 10,
            ..PipelineSettings::default()
        };
        let body: String = (0..lines).map(|i| format!("{{\"_id\":\"d{i}\",\"text\":\"t\"}}\n")).collect();
        std::fs::write(&p.input_file, body.trim_end()).unwrap();
        let meta = LedgerMeta { chunk_size: 10, model_id: "m".into(), dim: 4, input: "input.jsonl".into() };
        let mut ledger = ProgressLedger::open(&p.progress_dir, meta).unwrap();
        for &id in done {
            ledger.mark_done(ProgressMarker::now(id, format!("shard-{id}.parquet"), 10)).unwrap();
        }
        p
    }

    #[test]
    fn lines_are_counted_with_or_without_final_newline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("in.jsonl");
        std::fs::write(&path, "a\nb\nc").unwrap();
        assert_eq!(count_lines(&path, false).unwrap(), 3);
        std::fs::write(&path, "a\nb\nc\n").unwrap();
        assert_eq!(count_lines(&path, false).unwrap(), 3);
        std::fs::write(&path, "").unwrap();
        assert_eq!(count_lines(&path, false).unwrap(), 0);
    }

    #[test]
    fn consolidation_waits_for_every_chunk() {
        let tmp = tempfile::tempdir().unwrap();
        let p = ledger_with(tmp.path(), 35, &[0, 1, 3]);
        let err = completed_chunks(&p, false, false).unwrap_err();
        assert!(err.to_string().contains("1 of 4 chunks pending (first: 2)"), "{err}");
        assert_eq!(completed_chunks(&p, true, false).unwrap(), BTreeSet::from([0, 1, 3]));

        let tmp = tempfile::tempdir().unwrap();
        let p = ledger_with(tmp.path(), 35, &[0, 1, 2, 3]);
        assert_eq!(completed_chunks(&p, false, false).unwrap().len(), 4);
    }

    #[test]
    fn consolidation_needs_a_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let p = PipelineSettings { progress_dir: tmp.path().join("nowhere"), ..PipelineSettings::default() };
        let err = completed_chunks(&p, true, false).unwrap_err();
        assert!(err.to_string().contains("no ledger"), "{err}");
    }

    #[test]
    fn backend_flags_override_and_validate() {
        let mut s = BackendSettings::default();
        let args = BackendArgs {
            endpoints: vec!["http://x".into(), " ".into()],
            dim: Some(32),
            truncate_dim: Some(16),
            policy: Some("least-outstanding".into()),
            ..BackendArgs::default()
        };
        args.apply(&mut s).unwrap();
        assert_eq!(s.endpoints, vec!["http://x"]);
        assert_eq!((s.dim, s.output_dim()), (32, 16));
        assert_eq!(s.policy, BalancePolicy::LeastOutstanding);

        let bad = BackendArgs { truncate_dim: Some(64), ..BackendArgs::default() };
        assert!(bad.apply(&mut s).is_err());
    }
}
