//! Source tree walker.
//!
//! Enumerates textual files under a root in a deterministic order
//! (depth-first, siblings sorted by file name within each directory, so
//! `a/x` precedes `a-b/x`) and applies the exclusion
//! rules. Ignore entries are matched against the root-relative path:
//! plain entries by substring (which also covers equality and descendants),
//! entries with glob metacharacters through a [`GlobSet`].
//!
//! Files that cannot be read or are not valid UTF-8 text are reported as
//! [`WalkItem::Skipped`] rather than failing the walk.

use anyhow::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::models::SourceUnit;

/// Ignored regardless of user configuration.
pub const DEFAULT_IGNORE: &[&str] = &[
    ".git",
    ".venv",
    "node_modules",
    "__pycache__",
    ".terraform",
    ".vscode",
    "package-lock.json",
];

/// How many leading bytes are inspected for NUL when sniffing binaries.
const BINARY_SNIFF_LEN: usize = 8000;

/// Exclusion rules for a walk.
#[derive(Debug, Clone)]
pub struct WalkRules {
    ignore_paths: Vec<String>,
    ignore_exts: Vec<String>,
    /// Exact root-relative paths never walked (digest file, output, intro).
    excluded_files: BTreeSet<String>,
    globs: GlobSet,
    follow_symlinks: bool,
}

impl WalkRules {
    /// Build rules from user entries, merged with [`DEFAULT_IGNORE`].
    pub fn new(ignore_paths: &[String], ignore_exts: &[String]) -> Result<Self> {
        let mut paths: Vec<String> = DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect();
        for entry in ignore_paths {
            let entry = entry.trim().trim_end_matches('/').to_string();
            if !entry.is_empty() && !paths.contains(&entry) {
                paths.push(entry);
            }
        }

        let mut exts: Vec<String> = ignore_exts
            .iter()
            .map(|e| e.trim())
            .filter(|e| !e.is_empty())
            .map(|e| {
                if e.starts_with('.') {
                    e.to_string()
                } else {
                    format!(".{}", e)
                }
            })
            .collect();
        exts.sort();
        exts.dedup();

        let globs = build_globset(paths.iter().filter(|p| is_glob(p)))?;

        Ok(Self {
            ignore_paths: paths,
            ignore_exts: exts,
            excluded_files: BTreeSet::new(),
            globs,
            follow_symlinks: false,
        })
    }

    pub fn with_follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Never walk the file at this root-relative path.
    pub fn exclude_file(&mut self, relative: impl Into<String>) {
        self.excluded_files.insert(relative.into());
    }

    /// True if the root-relative path (file or directory) matches an ignore entry.
    pub fn is_path_excluded(&self, relative: &str) -> bool {
        if relative.is_empty() {
            return false;
        }
        if self.globs.is_match(relative) {
            return true;
        }
        self.ignore_paths
            .iter()
            .filter(|p| !is_glob(p))
            .any(|p| relative.contains(p.as_str()))
    }

    /// True if the file name ends with an ignored extension.
    pub fn is_ext_excluded(&self, relative: &str) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.ignore_exts.iter().any(|ext| name.ends_with(ext.as_str()))
    }

    pub fn excludes_file(&self, relative: &str) -> bool {
        self.excluded_files.contains(relative)
            || self.is_path_excluded(relative)
            || self.is_ext_excluded(relative)
    }

    /// SHA-256 over the rule set, so changing the rules invalidates digests.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        let mut paths = self.ignore_paths.clone();
        paths.sort();
        for p in &paths {
            hasher.update(b"path\0");
            hasher.update(p.as_bytes());
            hasher.update(b"\0");
        }
        for e in &self.ignore_exts {
            hasher.update(b"ext\0");
            hasher.update(e.as_bytes());
            hasher.update(b"\0");
        }
        for f in &self.excluded_files {
            hasher.update(b"file\0");
            hasher.update(f.as_bytes());
            hasher.update(b"\0");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// A file the walker refused, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

/// One step of a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkItem {
    Unit(SourceUnit),
    Skipped(SkippedFile),
}

/// Lazily walk `root`, yielding textual files in deterministic order.
pub fn walk<'a>(root: &'a Path, rules: &'a WalkRules) -> impl Iterator<Item = WalkItem> + 'a {
    WalkDir::new(root)
        .follow_links(rules.follow_symlinks)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !rules.is_path_excluded(&relative_path(root, entry.path()))
        })
        .filter_map(move |entry| match entry {
            Ok(entry) => {
                if !entry.file_type().is_file() {
                    return None;
                }
                let rel = relative_path(root, entry.path());
                if rules.excludes_file(&rel) {
                    return None;
                }
                Some(read_unit(entry.path(), rel))
            }
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                Some(WalkItem::Skipped(SkippedFile {
                    path,
                    reason: e.to_string(),
                }))
            }
        })
}

/// Walk and split the result into units and skipped files.
pub fn collect(root: &Path, rules: &WalkRules) -> (Vec<SourceUnit>, Vec<SkippedFile>) {
    let mut units = Vec::new();
    let mut skipped = Vec::new();
    for item in walk(root, rules) {
        match item {
            WalkItem::Unit(unit) => units.push(unit),
            WalkItem::Skipped(s) => {
                tracing::warn!(path = %s.path, reason = %s.reason, "skipping file");
                skipped.push(s);
            }
        }
    }
    (units, skipped)
}

fn read_unit(path: &Path, relative: String) -> WalkItem {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            return WalkItem::Skipped(SkippedFile {
                path: relative,
                reason: format!("unreadable: {}", e),
            })
        }
    };

    if bytes[..bytes.len().min(BINARY_SNIFF_LEN)].contains(&0) {
        return WalkItem::Skipped(SkippedFile {
            path: relative,
            reason: "binary content".to_string(),
        });
    }

    match String::from_utf8(bytes) {
        Ok(content) => WalkItem::Unit(SourceUnit {
            path: relative,
            content,
        }),
        Err(_) => WalkItem::Skipped(SkippedFile {
            path: relative,
            reason: "not valid UTF-8".to_string(),
        }),
    }
}

/// Root-relative, `/`-separated form of `path`.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Root-relative form of `path` if it lives under `root`, resolving both
/// through the filesystem where possible. `path` itself need not exist.
pub fn relative_under_root(root: &Path, path: &Path) -> Option<String> {
    let root = root.canonicalize().ok()?;
    let absolute: PathBuf = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(path)
    };
    let resolved = match absolute.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            let parent = absolute.parent()?.canonicalize().ok()?;
            parent.join(absolute.file_name()?)
        }
    };
    resolved
        .strip_prefix(&root)
        .ok()
        .map(|rel| relative_path(Path::new(""), rel))
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn build_globset<'a>(patterns: impl Iterator<Item = &'a String>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
