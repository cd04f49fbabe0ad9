//! Regeneration pipeline.
//!
//! Wires the stages together and owns the run's side effects:
//!
//! ```text
//! walk → digest gate ─┬─ unchanged → UpToDate (no oracle calls, no writes)
//!                     └─ stale → chunk → file summaries → directory tree
//!                                → tools → merge → write output → commit digest
//! ```
//!
//! Every oracle call happens before the first write. A fatal error
//! therefore leaves both the output document and the digest file exactly as
//! they were, and the next invocation starts from scratch. Non-fatal
//! conditions are collected as [`RunWarning`]s in the [`RunReport`].

use anyhow::{Context, Result};
use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::aggregate::{AggregateSettings, Aggregator, DirTree, TreeSummary};
use crate::chunk::{chunk_unit, collect_findings};
use crate::config::{Config, RunOptions};
use crate::digest::{self, DigestSnapshot, DigestStore, LoadedDigest};
use crate::merge::{self, MergeEngine, MergeInputs};
use crate::models::{AnnotatedFinding, Chunk, Summary, SummaryLevel};
use crate::oracle::{Oracle, OracleAdapter, OracleError, RetryPolicy};
use crate::progress::{NoProgress, PipelineProgressEvent, ProgressReporter};
use crate::tools::{self, StaticDetection};
use crate::walker::{self, WalkRules};

/// Optional free-text introduction at the root, never walked.
pub const INTRO_FILE: &str = "repo.intro";

/// A non-fatal condition encountered during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunWarning {
    /// A file was unreadable or not text and was skipped.
    IoFailure { path: String, reason: String },
    /// The digest file could not be parsed; everything was treated as stale.
    DigestCorrupt(String),
    /// A single line exceeded the chunk budget.
    OversizedChunk {
        path: String,
        index: usize,
        tokens: usize,
    },
    /// The oracle could not merge a section; the new content was kept.
    MergeConflict { section: String },
}

impl fmt::Display for RunWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunWarning::IoFailure { path, reason } => write!(f, "skipped {}: {}", path, reason),
            RunWarning::DigestCorrupt(reason) => {
                write!(f, "digest file unreadable ({}); regenerated everything", reason)
            }
            RunWarning::OversizedChunk {
                path,
                index,
                tokens,
            } => write!(
                f,
                "{} chunk {} is ~{} tokens, over the chunk budget",
                path, index, tokens
            ),
            RunWarning::MergeConflict { section } => {
                write!(f, "could not merge section '{}'; kept new content", section)
            }
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Digests matched; nothing was generated or written.
    UpToDate,
    /// The document was written and the digest committed at `digest_version`.
    Regenerated { output: PathBuf, digest_version: u64 },
}

/// Summary of one invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub warnings: Vec<RunWarning>,
    /// Oracle requests sent, retries included.
    pub oracle_calls: usize,
    pub files: usize,
    pub chunks: usize,
}

/// One configured regeneration of a documentation file.
pub struct Pipeline {
    config: Config,
    options: RunOptions,
    oracle: Arc<dyn Oracle>,
    progress: Box<dyn ProgressReporter>,
}

impl Pipeline {
    pub fn new(config: Config, options: RunOptions, oracle: Arc<dyn Oracle>) -> Self {
        Self {
            config,
            options,
            oracle,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Walk rules from the config file and CLI, plus the pipeline's own files.
    pub fn rules(&self) -> Result<WalkRules> {
        let ignore: Vec<String> = self
            .config
            .walk
            .ignore
            .iter()
            .chain(&self.options.ignore)
            .cloned()
            .collect();
        let ignore_ext: Vec<String> = self
            .config
            .walk
            .ignore_ext
            .iter()
            .chain(&self.options.ignore_ext)
            .cloned()
            .collect();

        let mut rules = WalkRules::new(&ignore, &ignore_ext)
            .context("Invalid ignore pattern")?
            .with_follow_symlinks(self.config.walk.follow_symlinks);

        let root = &self.options.root;
        let intro = root.join(INTRO_FILE);
        let own_files = [
            Some(self.options.digest_file.as_path()),
            Some(self.options.output.as_path()),
            Some(self.options.existing_doc_path()),
            self.options.template.as_deref(),
            Some(intro.as_path()),
        ];
        for path in own_files.into_iter().flatten() {
            if let Some(relative) = walker::relative_under_root(root, path) {
                rules.exclude_file(relative);
            }
        }
        Ok(rules)
    }

    pub fn digest_store(&self) -> DigestStore {
        DigestStore::new(&self.options.digest_file)
    }

    /// Staleness only: no oracle calls, no writes.
    pub fn check(&self) -> Result<bool> {
        self.ensure_root()?;
        let rules = self.rules()?;
        Ok(self
            .digest_store()
            .is_stale(&self.options.root, &rules, self.options.force))
    }

    /// Tools recognised by the static signature table. No oracle calls.
    pub fn static_tools(&self) -> Result<StaticDetection> {
        self.ensure_root()?;
        let rules = self.rules()?;
        let (units, _) = walker::collect(&self.options.root, &rules);
        Ok(tools::detect_static(units.iter().map(|u| u.path.as_str())))
    }

    /// Run the whole pipeline.
    ///
    /// # Errors
    ///
    /// Fails on a fatal oracle error (after retries), on an empty tree with
    /// no intro, or when the output or digest file cannot be written. On
    /// failure neither file has been modified.
    pub async fn run(&self) -> Result<RunReport> {
        self.ensure_root()?;
        let root = &self.options.root;
        let rules = self.rules()?;
        let store = self.digest_store();
        let mut warnings = Vec::new();

        let loaded = store.load();
        if let LoadedDigest::Corrupt(reason) = &loaded {
            tracing::warn!(
                path = %store.path().display(),
                %reason,
                "digest file unreadable, treating everything as stale"
            );
            warnings.push(RunWarning::DigestCorrupt(reason.clone()));
        }

        self.progress.report(PipelineProgressEvent::Discovering {
            root: root.display().to_string(),
        });
        let (units, skipped) = walker::collect(root, &rules);
        warnings.extend(skipped.into_iter().map(|s| RunWarning::IoFailure {
            path: s.path,
            reason: s.reason,
        }));

        let current = DigestSnapshot::compute(&units, &rules);
        if !digest::is_stale(loaded.snapshot(), &current, self.options.force) {
            tracing::info!(files = units.len(), "no changes detected, skipping regeneration");
            return Ok(RunReport {
                outcome: RunOutcome::UpToDate,
                warnings,
                oracle_calls: 0,
                files: units.len(),
                chunks: 0,
            });
        }

        let intro = read_optional(&root.join(INTRO_FILE))?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if units.is_empty() && intro.is_none() {
            anyhow::bail!(
                "No textual files found under {} and no {} content",
                root.display(),
                INTRO_FILE
            );
        }

        let adapter = Arc::new(OracleAdapter::new(
            self.oracle.clone(),
            RetryPolicy::from_config(&self.config.oracle),
            self.config.oracle.workers,
        ));
        let temperature = self.options.temperature;
        let aggregator = Aggregator::new(
            adapter.clone(),
            AggregateSettings {
                max_tokens: self.config.chunking.max_tokens,
                summary_tokens: self.config.chunking.summary_tokens,
                directory_tokens: self.config.chunking.directory_tokens,
                temperature,
            },
        );

        let chunked: Vec<(&str, Vec<Chunk>)> = units
            .iter()
            .map(|u| (u.path.as_str(), chunk_unit(u, self.config.chunking.max_tokens)))
            .collect();
        for chunk in chunked.iter().flat_map(|(_, c)| c).filter(|c| c.oversized) {
            tracing::warn!(
                path = %chunk.source_path,
                chunk = chunk.index,
                tokens = chunk.approx_tokens,
                "line exceeds chunk budget"
            );
            warnings.push(RunWarning::OversizedChunk {
                path: chunk.source_path.clone(),
                index: chunk.index,
                tokens: chunk.approx_tokens,
            });
        }
        let chunk_count: usize = chunked.iter().map(|(_, c)| c.len()).sum();
        let findings: Vec<AnnotatedFinding> = chunked
            .iter()
            .flat_map(|(_, c)| collect_findings(c))
            .collect();
        tracing::info!(
            files = units.len(),
            chunks = chunk_count,
            findings = findings.len(),
            "chunked source tree"
        );

        let file_summaries = self
            .summarize_files(&aggregator, &chunked)
            .await
            .context("Failed to summarize files")?;

        let tree_summary = if file_summaries.is_empty() {
            TreeSummary {
                root: Summary {
                    scope_path: String::new(),
                    level: SummaryLevel::Directory,
                    text: String::new(),
                    token_count: 0,
                },
                directories: BTreeMap::new(),
            }
        } else {
            let tree = DirTree::from_files(file_summaries.keys().map(String::as_str));
            self.progress.report(PipelineProgressEvent::Folding {
                directories: tree.nodes.len() as u64,
            });
            aggregator
                .aggregate_tree(&tree, &file_summaries)
                .await
                .context("Failed to summarize directories")?
        };

        let paths = units.iter().map(|u| u.path.as_str());
        let tools = tools::detect_tools(paths, &adapter, temperature)
            .await
            .context("Failed to detect tools")?;

        let old_doc = read_optional(self.options.existing_doc_path())?;
        let template = match &self.options.template {
            Some(path) => read_optional(path)?,
            None => None,
        };

        self.progress.report(PipelineProgressEvent::Merging);
        let project_name = project_name(root);
        let engine = MergeEngine::new(adapter.clone(), self.options.max_tokens, temperature);
        let merged = engine
            .merge(MergeInputs {
                project_name: &project_name,
                old_doc: old_doc.as_deref(),
                template: template.as_deref(),
                intro: intro.as_deref(),
                aggregate: &tree_summary.root,
                tools: &tools,
                findings: &findings,
                directories: self
                    .options
                    .directory_summary
                    .then_some(&tree_summary.directories),
            })
            .await
            .context("Failed to merge documentation")?;
        warnings.extend(
            merged
                .conflicts
                .into_iter()
                .map(|section| RunWarning::MergeConflict { section }),
        );

        merge::write_output(
            &self.options.output,
            &merged.document.render(),
            self.options.mode,
        )
        .with_context(|| format!("Failed to write {}", self.options.output.display()))?;

        let committed = current.succeeding(loaded.snapshot());
        store.commit(&committed)?;

        Ok(RunReport {
            outcome: RunOutcome::Regenerated {
                output: self.options.output.clone(),
                digest_version: committed.version,
            },
            warnings,
            oracle_calls: adapter.calls(),
            files: units.len(),
            chunks: chunk_count,
        })
    }

    async fn summarize_files(
        &self,
        aggregator: &Aggregator,
        chunked: &[(&str, Vec<Chunk>)],
    ) -> Result<BTreeMap<String, Summary>, OracleError> {
        let total = chunked.len() as u64;
        let done = AtomicU64::new(0);
        let done = &done;
        let summaries = try_join_all(chunked.iter().map(|(path, chunks)| async move {
            let summary = aggregator.aggregate_file(path, chunks).await?;
            let n = done.fetch_add(1, Ordering::SeqCst) + 1;
            self.progress
                .report(PipelineProgressEvent::Summarizing { n, total });
            Ok::<_, OracleError>(summary)
        }))
        .await?;
        Ok(summaries
            .into_iter()
            .map(|s| (s.scope_path.clone(), s))
            .collect())
    }

    fn ensure_root(&self) -> Result<()> {
        if !self.options.root.is_dir() {
            anyhow::bail!("Root directory not found: {}", self.options.root.display());
        }
        Ok(())
    }
}

/// File contents, or `None` when the file does not exist.
fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(s)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Title fallback: the root directory's name.
fn project_name(root: &Path) -> String {
    root.canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "Project".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::DisabledOracle;
    use std::fs;
    use tempfile::TempDir;

    fn pipeline(root: &Path) -> Pipeline {
        Pipeline::new(
            Config::default(),
            RunOptions::new(root),
            Arc::new(DisabledOracle),
        )
    }

    #[test]
    fn test_rules_exclude_own_files() {
        let tmp = TempDir::new().unwrap();
        let rules = pipeline(tmp.path()).rules().unwrap();
        for name in ["README.md", "readme.digests", "readme.template", INTRO_FILE] {
            assert!(rules.excludes_file(name), "{} should be excluded", name);
        }
        assert!(!rules.excludes_file("src/main.rs"));
    }

    #[test]
    fn test_check_reports_stale_without_digest() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("main.py"), "print('hi')\n").unwrap();
        assert!(pipeline(tmp.path()).check().unwrap());
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let err = pipeline(&tmp.path().join("nope")).check().unwrap_err();
        assert!(err.to_string().contains("Root directory not found"));
    }

    #[tokio::test]
    async fn test_empty_tree_without_intro_aborts_before_oracle() {
        let tmp = TempDir::new().unwrap();
        let err = pipeline(tmp.path()).run().await.unwrap_err();
        assert!(err.to_string().contains("No textual files"));
        assert!(!tmp.path().join("readme.digests").exists());
    }

    #[tokio::test]
    async fn test_disabled_oracle_is_fatal_and_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("main.py"), "print('hi')\n").unwrap();
        fs::write(tmp.path().join("README.md"), "# old\n").unwrap();

        assert!(pipeline(tmp.path()).run().await.is_err());
        assert!(!tmp.path().join("readme.digests").exists());
        assert_eq!(
            fs::read_to_string(tmp.path().join("README.md")).unwrap(),
            "# old\n"
        );
    }

    #[test]
    fn test_warning_display() {
        let w = RunWarning::MergeConflict {
            section: "Usage".to_string(),
        };
        assert_eq!(w.to_string(), "could not merge section 'Usage'; kept new content");
    }
}
