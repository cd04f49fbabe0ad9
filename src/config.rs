//! Configuration loading.
//!
//! Settings come from an optional TOML file (oracle backend, chunk budgets,
//! walk rules) and from per-invocation [`RunOptions`] assembled by the CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::aggregate::FOLD_HEADER_TOKENS;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub walk: WalkConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Hard input limit of the provider, in estimated tokens.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
    /// Upper bound on concurrent oracle calls.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            url: default_url(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            timeout_secs: default_timeout_secs(),
            max_input_tokens: default_max_input_tokens(),
            workers: default_workers(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o".to_string()
}
fn default_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_input_tokens() -> usize {
    100_000
}
fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Budget for a single chunk and for every fold call's input.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Output cap for chunk and file summaries.
    #[serde(default = "default_summary_tokens")]
    pub summary_tokens: usize,
    /// Output cap for directory summaries.
    #[serde(default = "default_directory_tokens")]
    pub directory_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            summary_tokens: default_summary_tokens(),
            directory_tokens: default_directory_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    1200
}
fn default_summary_tokens() -> usize {
    300
}
fn default_directory_tokens() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WalkConfig {
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub ignore_ext: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl OracleConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// How the generated document is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Replace the output file entirely.
    #[default]
    Overwrite,
    /// Keep the existing file content and add the document after a separator.
    Append,
}

/// Per-invocation options, mostly straight from the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub root: PathBuf,
    pub output: PathBuf,
    /// Existing documentation to merge; defaults to `output`.
    pub existing_doc: Option<PathBuf>,
    pub template: Option<PathBuf>,
    pub mode: OutputMode,
    /// Output budget of the final-document oracle calls.
    pub max_tokens: usize,
    pub temperature: f32,
    pub force: bool,
    pub ignore: Vec<String>,
    pub ignore_ext: Vec<String>,
    pub digest_file: PathBuf,
    pub directory_summary: bool,
}

impl RunOptions {
    /// Options with the documented defaults for `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            output: root.join("README.md"),
            existing_doc: None,
            template: Some(root.join("readme.template")),
            digest_file: root.join("readme.digests"),
            root,
            mode: OutputMode::Overwrite,
            max_tokens: 1500,
            temperature: 0.3,
            force: false,
            ignore: Vec::new(),
            ignore_ext: Vec::new(),
            directory_summary: true,
        }
    }

    pub fn existing_doc_path(&self) -> &Path {
        self.existing_doc.as_deref().unwrap_or(&self.output)
    }
}

/// Load configuration from `path`. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.summary_tokens == 0 || config.chunking.directory_tokens == 0 {
        anyhow::bail!("chunking.summary_tokens and chunking.directory_tokens must be > 0");
    }
    let largest_output = config
        .chunking
        .summary_tokens
        .max(config.chunking.directory_tokens);
    if 2 * largest_output + FOLD_HEADER_TOKENS > config.chunking.max_tokens {
        anyhow::bail!(
            "chunking.max_tokens must fit two summaries plus a fold header ({} tokens)",
            2 * largest_output + FOLD_HEADER_TOKENS
        );
    }
    if config.oracle.workers == 0 {
        anyhow::bail!("oracle.workers must be >= 1");
    }
    if config.oracle.max_input_tokens < config.chunking.max_tokens {
        anyhow::bail!("oracle.max_input_tokens must be >= chunking.max_tokens");
    }

    match config.oracle.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown oracle provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let cfg = load_config(&tmp.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.oracle.model, "gpt-4o");
        assert_eq!(cfg.chunking.max_tokens, 1200);
        assert!(cfg.oracle.is_enabled());
    }

    #[test]
    fn test_partial_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docweave.toml");
        std::fs::write(
            &path,
            "[oracle]\nmodel = \"gpt-4o-mini\"\nworkers = 2\n\n[walk]\nignore = [\"dist\"]\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.oracle.model, "gpt-4o-mini");
        assert_eq!(cfg.oracle.workers, 2);
        assert_eq!(cfg.oracle.max_retries, 5);
        assert_eq!(cfg.walk.ignore, vec!["dist".to_string()]);
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docweave.toml");
        std::fs::write(&path, "[oracle]\nprovider = \"carrier-pigeon\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("Unknown oracle provider"));
    }

    #[test]
    fn test_rejects_zero_budget() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docweave.toml");
        std::fs::write(&path, "[chunking]\nmax_tokens = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_rejects_budget_too_small_to_fold() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("docweave.toml");
        std::fs::write(&path, "[chunking]\nmax_tokens = 900\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("fit two summaries"));

        std::fs::write(
            &path,
            "[chunking]\nmax_tokens = 900\ndirectory_tokens = 300\n",
        )
        .unwrap();
        assert!(load_config(&path).is_ok());
    }

    #[test]
    fn test_existing_doc_defaults_to_output() {
        let opts = RunOptions::new("/repo");
        assert_eq!(opts.existing_doc_path(), Path::new("/repo/README.md"));
    }
}
