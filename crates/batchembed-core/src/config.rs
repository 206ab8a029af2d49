//! Layered configuration loader, typed settings and path helpers.
//!
//! Uses Figment to merge `config.toml` + `config.<env>.toml` + `APP_*` env vars.
//! Nested keys come from `__` in variable names, e.g.
//! `APP_PIPELINE__CONCURRENCY=64` sets `pipeline.concurrency`.
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

pub struct Config {
    figment: Figment,
}

impl Config {
    /// Load from the current working directory.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Load `config.toml` and the `RUST_ENV` overlay from `base`, then `APP_*` env vars.
    pub fn load_from(base: &Path) -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::new().merge(Toml::file(base.join("config.toml")));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file(base.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(base.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(base.join("config.test.toml"))),
            other => tracing::warn!(env = other, "unknown RUST_ENV, using config.toml and env vars only"),
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        Ok(Self { figment })
    }

    pub fn from_figment(figment: Figment) -> Self {
        Self { figment }
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{}': {}", key, e)))
    }

    /// Like [`Config::get`], but an absent section yields `T::default()`.
    pub fn get_or_default<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        if self.figment.contains(key) {
            self.get(key)
        } else {
            Ok(T::default())
        }
    }

    pub fn pipeline(&self) -> Result<PipelineSettings> {
        self.get_or_default("pipeline")
    }

    pub fn backend(&self) -> Result<BackendSettings> {
        self.get_or_default("backend")
    }

    pub fn consolidate(&self) -> Result<ConsolidateSettings> {
        self.get_or_default("consolidate")
    }
}

/// How a request picks its endpoint from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    #[default]
    RoundRobin,
    LeastOutstanding,
}

impl FromStr for BalancePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(Self::RoundRobin),
            "least_outstanding" | "least_outstanding_requests" | "lor" => Ok(Self::LeastOutstanding),
            other => Err(Error::InvalidConfig(format!("unknown balance policy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub input_file: PathBuf,
    pub shard_dir: PathBuf,
    pub progress_dir: PathBuf,
    pub chunk_size: usize,
    pub concurrency: usize,
    /// Texts per backend request; `None` sends a whole chunk at once.
    pub request_batch_size: Option<usize>,
    /// Total attempts per request, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_error_rate: f64,
    pub error_window: usize,
    pub report_interval_secs: u64,
    pub clean_text: bool,
    pub max_text_chars: usize,
    pub verify_shards: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            input_file: PathBuf::from("data/input.jsonl"),
            shard_dir: PathBuf::from("data/shards"),
            progress_dir: PathBuf::from("data/progress"),
            chunk_size: 1000,
            concurrency: 128,
            request_batch_size: None,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_error_rate: 0.5,
            error_window: 200,
            report_interval_secs: 5,
            clean_text: false,
            max_text_chars: 1000,
            verify_shards: true,
        }
    }
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("pipeline.chunk_size must be > 0".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidConfig("pipeline.concurrency must be > 0".into()));
        }
        if self.request_batch_size == Some(0) {
            return Err(Error::InvalidConfig("pipeline.request_batch_size must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig("pipeline.max_attempts must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(Error::InvalidConfig("pipeline.max_error_rate must be within [0, 1]".into()));
        }
        if self.error_window == 0 {
            return Err(Error::InvalidConfig("pipeline.error_window must be > 0".into()));
        }
        if self.clean_text && self.max_text_chars == 0 {
            return Err(Error::InvalidConfig("pipeline.max_text_chars must be > 0".into()));
        }
        Ok(())
    }

    /// Expand `~` and env vars in every path, resolving relatives against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        self.input_file = resolve_with_base(base, self.input_file.to_string_lossy());
        self.shard_dir = resolve_with_base(base, self.shard_dir.to_string_lossy());
        self.progress_dir = resolve_with_base(base, self.progress_dir.to_string_lossy());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub endpoints: Vec<String>,
    pub model_id: String,
    /// Vector length the model must return.
    pub dim: usize,
    /// Keep only the leading components and renormalize.
    pub truncate_dim: Option<usize>,
    pub request_timeout_secs: u64,
    pub policy: BalancePolicy,
    /// Ask the server to truncate over-long inputs instead of rejecting them.
    pub truncate_inputs: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:8080/embed".to_string()],
            model_id: "google/embeddinggemma-300m".to_string(),
            dim: 768,
            truncate_dim: None,
            request_timeout_secs: 120,
            policy: BalancePolicy::RoundRobin,
            truncate_inputs: true,
        }
    }
}

impl BackendSettings {
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(Error::InvalidConfig("backend.endpoints is empty".into()));
        }
        if self.model_id.trim().is_empty() {
            return Err(Error::InvalidConfig("backend.model_id is empty".into()));
        }
        if self.dim == 0 {
            return Err(Error::InvalidConfig("backend.dim must be > 0".into()));
        }
        if let Some(t) = self.truncate_dim {
            if t == 0 || t > self.dim {
                return Err(Error::InvalidConfig(format!(
                    "backend.truncate_dim must be within 1..={}, got {}",
                    self.dim, t
                )));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig("backend.request_timeout_secs must be > 0".into()));
        }
        Ok(())
    }

    /// Dimension of vectors as they land in shard files.
    pub fn output_dim(&self) -> usize {
        self.truncate_dim.unwrap_or(self.dim)
    }

    /// Split comma separated endpoint lists and drop blanks.
    pub fn normalize_endpoints(&mut self) {
        self.endpoints = self
            .endpoints
            .iter()
            .flat_map(|e| e.split(','))
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidateSettings {
    pub shard_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_records_per_file: usize,
    pub row_group_size: usize,
    pub delete_sources: bool,
}

impl Default for ConsolidateSettings {
    fn default() -> Self {
        Self {
            shard_dir: PathBuf::from("data/shards"),
            output_dir: PathBuf::from("data/consolidated"),
            max_records_per_file: 1_000_000,
            row_group_size: 65_536,
            delete_sources: false,
        }
    }
}

impl ConsolidateSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_records_per_file == 0 {
            return Err(Error::InvalidConfig("consolidate.max_records_per_file must be > 0".into()));
        }
        if self.row_group_size == 0 {
            return Err(Error::InvalidConfig("consolidate.row_group_size must be > 0".into()));
        }
        if self.shard_dir == self.output_dir {
            return Err(Error::InvalidConfig("consolidate.output_dir must differ from shard_dir".into()));
        }
        Ok(())
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        self.shard_dir = resolve_with_base(base, self.shard_dir.to_string_lossy());
        self.output_dir = resolve_with_base(base, self.output_dir.to_string_lossy());
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}
