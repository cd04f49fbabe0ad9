//! Digest store: the only durable state between runs.
//!
//! A [`DigestSnapshot`] maps every walked file to a SHA-256 fingerprint of
//! its relative path and content, plus a fingerprint of the exclusion rules
//! and a logical version. The pipeline compares the snapshot it computes
//! against the one on disk; only if they differ (or `force` is set) does
//! regeneration run. After a successful run the new snapshot is committed
//! with write-to-temp-then-rename so a crash never leaves a partial file.
//!
//! # File format
//!
//! A flat JSON object of `path → fingerprint` strings, with two reserved
//! keys that can never collide with a relative path:
//!
//! ```json
//! {
//!   "@rules": "5d41…",
//!   "@version": "3",
//!   "src/main.rs": "9f86…"
//! }
//! ```

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::SourceUnit;
use crate::walker::{self, WalkRules};

const RULES_KEY: &str = "@rules";
const VERSION_KEY: &str = "@version";

/// One path's fingerprint as of a given snapshot version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestRecord {
    pub path: String,
    pub fingerprint: String,
    pub last_seen_at: u64,
}

/// The full path → fingerprint mapping for one state of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DigestSnapshot {
    pub version: u64,
    pub rules_fingerprint: String,
    pub files: BTreeMap<String, String>,
}

impl DigestSnapshot {
    /// Fingerprint every unit. The version is assigned at commit time.
    pub fn compute(units: &[SourceUnit], rules: &WalkRules) -> Self {
        let files = units
            .iter()
            .map(|u| (u.path.clone(), fingerprint(&u.path, &u.content)))
            .collect();
        Self {
            version: 0,
            rules_fingerprint: rules.fingerprint(),
            files,
        }
    }

    /// True when the tree content or the rule set differs.
    pub fn differs_from(&self, other: &DigestSnapshot) -> bool {
        self.rules_fingerprint != other.rules_fingerprint || self.files != other.files
    }

    /// The snapshot as individual records.
    pub fn records(&self) -> Vec<DigestRecord> {
        self.files
            .iter()
            .map(|(path, fp)| DigestRecord {
                path: path.clone(),
                fingerprint: fp.clone(),
                last_seen_at: self.version,
            })
            .collect()
    }

    /// The successor of `previous`: same mapping, next logical version.
    pub fn succeeding(mut self, previous: Option<&DigestSnapshot>) -> Self {
        self.version = previous.map(|p| p.version + 1).unwrap_or(1);
        self
    }

    fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert(
            RULES_KEY.to_string(),
            serde_json::Value::String(self.rules_fingerprint.clone()),
        );
        map.insert(
            VERSION_KEY.to_string(),
            serde_json::Value::String(self.version.to_string()),
        );
        for (path, fp) in &self.files {
            map.insert(path.clone(), serde_json::Value::String(fp.clone()));
        }
        serde_json::Value::Object(map)
    }

    fn from_json(text: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> =
            serde_json::from_str(text).context("digest file is not a string map")?;
        let mut files = BTreeMap::new();
        let mut rules_fingerprint = None;
        let mut version = None;
        for (key, value) in raw {
            match key.as_str() {
                RULES_KEY => rules_fingerprint = Some(value),
                VERSION_KEY => version = Some(value.parse::<u64>().context("bad version")?),
                _ => {
                    files.insert(key, value);
                }
            }
        }
        Ok(Self {
            version: version.ok_or_else(|| anyhow::anyhow!("missing {}", VERSION_KEY))?,
            rules_fingerprint: rules_fingerprint
                .ok_or_else(|| anyhow::anyhow!("missing {}", RULES_KEY))?,
            files,
        })
    }
}

/// SHA-256 hex over the relative path and the content.
pub fn fingerprint(path: &str, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Result of reading the digest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedDigest {
    Missing,
    /// Present but unparseable; treated as "everything stale".
    Corrupt(String),
    Valid(DigestSnapshot),
}

impl LoadedDigest {
    pub fn snapshot(&self) -> Option<&DigestSnapshot> {
        match self {
            LoadedDigest::Valid(s) => Some(s),
            _ => None,
        }
    }
}

/// Staleness decision for `current` against what was last committed.
pub fn is_stale(previous: Option<&DigestSnapshot>, current: &DigestSnapshot, force: bool) -> bool {
    match previous {
        _ if force => true,
        None => true,
        Some(prev) => current.differs_from(prev),
    }
}

/// Reads and atomically writes the digest file.
#[derive(Debug, Clone)]
pub struct DigestStore {
    path: PathBuf,
}

impl DigestStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last committed snapshot. Never fails: absence and parse
    /// errors are reported through [`LoadedDigest`].
    pub fn load(&self) -> LoadedDigest {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadedDigest::Missing,
            Err(e) => return LoadedDigest::Corrupt(e.to_string()),
        };
        match DigestSnapshot::from_json(&text) {
            Ok(snapshot) => LoadedDigest::Valid(snapshot),
            Err(e) => LoadedDigest::Corrupt(format!("{:#}", e)),
        }
    }

    /// Walk `root` under `rules` and decide whether regeneration is needed.
    pub fn is_stale(&self, root: &Path, rules: &WalkRules, force: bool) -> bool {
        let (units, _) = walker::collect(root, rules);
        let current = DigestSnapshot::compute(&units, rules);
        is_stale(self.load().snapshot(), &current, force)
    }

    /// Replace the digest file with `snapshot` (temp file + rename).
    pub fn commit(&self, snapshot: &DigestSnapshot) -> Result<()> {
        let json = serde_json::to_string_pretty(&snapshot.to_json())?;
        write_atomic(&self.path, json.as_bytes())
            .with_context(|| format!("Failed to write digest file: {}", self.path.display()))?;
        tracing::info!(
            path = %self.path.display(),
            version = snapshot.version,
            files = snapshot.files.len(),
            "committed digests"
        );
        Ok(())
    }
}

/// Write `bytes` to a sibling temp file, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("not a file path: {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp = path.with_file_name(tmp_name);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn unit(path: &str, content: &str) -> SourceUnit {
        SourceUnit {
            path: path.to_string(),
            content: content.to_string(),
        }
    }

    fn rules() -> WalkRules {
        WalkRules::new(&[], &[]).unwrap()
    }

    #[test]
    fn test_first_run_is_stale() {
        let current = DigestSnapshot::compute(&[unit("a", "x")], &rules());
        assert!(is_stale(None, &current, false));
    }

    #[test]
    fn test_unchanged_not_stale_changed_stale() {
        let prev = DigestSnapshot::compute(&[unit("a", "x"), unit("b", "y")], &rules());
        let same = DigestSnapshot::compute(&[unit("a", "x"), unit("b", "y")], &rules());
        assert!(!is_stale(Some(&prev), &same, false));
        assert!(is_stale(Some(&prev), &same, true));

        let edited = DigestSnapshot::compute(&[unit("a", "x"), unit("b", "z")], &rules());
        assert!(is_stale(Some(&prev), &edited, false));

        let removed = DigestSnapshot::compute(&[unit("a", "x")], &rules());
        assert!(is_stale(Some(&prev), &removed, false));

        let added =
            DigestSnapshot::compute(&[unit("a", "x"), unit("b", "y"), unit("c", "")], &rules());
        assert!(is_stale(Some(&prev), &added, false));
    }

    #[test]
    fn test_rule_change_is_stale() {
        let prev = DigestSnapshot::compute(&[unit("a", "x")], &rules());
        let other_rules = WalkRules::new(&["dist".to_string()], &[]).unwrap();
        let current = DigestSnapshot::compute(&[unit("a", "x")], &other_rules);
        assert!(is_stale(Some(&prev), &current, false));
    }

    #[test]
    fn test_rename_changes_fingerprint() {
        assert_ne!(fingerprint("a.rs", "x"), fingerprint("b.rs", "x"));
    }

    #[test]
    fn test_commit_and_load_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = DigestStore::new(tmp.path().join("readme.digests"));
        assert_eq!(store.load(), LoadedDigest::Missing);

        let snap = DigestSnapshot::compute(&[unit("src/a.rs", "x")], &rules()).succeeding(None);
        assert_eq!(snap.version, 1);
        store.commit(&snap).unwrap();
        assert_eq!(store.load(), LoadedDigest::Valid(snap.clone()));

        let next = snap.clone().succeeding(Some(&snap));
        assert_eq!(next.version, 2);
        assert!(next.records().iter().all(|r| r.last_seen_at == 2));

        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_reported_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("readme.digests");
        fs::write(&path, "{ not json").unwrap();
        let store = DigestStore::new(&path);
        assert!(matches!(store.load(), LoadedDigest::Corrupt(_)));
        assert!(store.load().snapshot().is_none());
    }

    #[test]
    fn test_store_is_stale_against_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("main.py"), "print(1)\n").unwrap();
        let store = DigestStore::new(tmp.path().join("readme.digests"));
        let rules = rules();

        assert!(store.is_stale(&root, &rules, false));
        let (units, _) = walker::collect(&root, &rules);
        store
            .commit(&DigestSnapshot::compute(&units, &rules).succeeding(None))
            .unwrap();
        assert!(!store.is_stale(&root, &rules, false));

        fs::write(root.join("main.py"), "print(2)\n").unwrap();
        assert!(store.is_stale(&root, &rules, false));
    }
}
