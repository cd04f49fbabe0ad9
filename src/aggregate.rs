//! Hierarchical summarization: chunks → file → directory → root.
//!
//! File summaries are built by summarizing every chunk (concurrently, then
//! reassembled in chunk order) and folding the ordered chunk summaries with
//! one more oracle call. Directory summaries fold the summaries of the
//! directory's immediate files and subdirectories, sorted by path, and never
//! look at raw file content.
//!
//! The directory hierarchy is an arena ([`DirTree`]) processed bottom-up one
//! depth level at a time: siblings at the same depth are summarized
//! concurrently, and a parent only runs after all of its children are done.
//!
//! Every fold respects the `max_tokens` input budget. When the concatenated
//! parts are too large they are greedily packed into batches that fit, each
//! batch is pre-summarized, and the fold repeats over the batch summaries.

use futures::future::try_join_all;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chunk::{chunk_text, estimate_tokens};
use crate::models::{Chunk, Summary, SummaryLevel};
use crate::oracle::{OracleAdapter, OracleError};

const CHUNK_PROMPT: &str =
    "You are a code summarizer. Summarize the given file content briefly.";
const FILE_FOLD_PROMPT: &str =
    "You are a code summarizer. Combine partial summaries into one final summary.";
const DIRECTORY_PROMPT: &str =
    "You are a code summarizer. Summarize a directory based on the summaries of its files and subdirectories.";
const BATCH_PROMPT: &str =
    "You are a code summarizer. Condense these summaries into one shorter summary, keeping every distinct fact.";

/// Upper bound on a fold header's size, excluding very long paths.
pub const FOLD_HEADER_TOKENS: usize = 64;

/// Room for the `Part N summary:` label added to each condensed part.
const PART_LABEL_TOKENS: usize = 8;

/// Budgets and sampling used by the aggregator.
#[derive(Debug, Clone, Copy)]
pub struct AggregateSettings {
    /// Input budget for every oracle call, in estimated tokens.
    pub max_tokens: usize,
    /// Output cap for chunk and file summaries.
    pub summary_tokens: usize,
    /// Output cap for directory summaries.
    pub directory_tokens: usize,
    pub temperature: f32,
}

pub struct Aggregator {
    oracle: Arc<OracleAdapter>,
    settings: AggregateSettings,
}

impl Aggregator {
    pub fn new(oracle: Arc<OracleAdapter>, settings: AggregateSettings) -> Self {
        Self { oracle, settings }
    }

    /// Summarize one file from its ordered chunks.
    pub async fn aggregate_file(
        &self,
        path: &str,
        chunks: &[Chunk],
    ) -> Result<Summary, OracleError> {
        if chunks.is_empty() {
            return Ok(summary(path, SummaryLevel::File, "(empty file)".to_string()));
        }

        let chunk_summaries = try_join_all(chunks.iter().map(|c| self.summarize_chunk(c))).await?;

        if let [only] = chunk_summaries.as_slice() {
            return Ok(summary(path, SummaryLevel::File, only.text.clone()));
        }

        let parts: Vec<String> = chunk_summaries
            .iter()
            .enumerate()
            .map(|(i, s)| format!("Chunk {} summary: {}", i + 1, s.text))
            .collect();
        let header = format!(
            "File: {}\n\nCombine these partial summaries into a single, concise summary:\n\n",
            path
        );
        let text = self
            .fold(&header, parts, FILE_FOLD_PROMPT, self.settings.summary_tokens)
            .await?;
        Ok(summary(path, SummaryLevel::File, text))
    }

    /// Fold the summaries of a directory's immediate members. The order in
    /// which `children` were computed is irrelevant: they are sorted by path.
    pub async fn aggregate_directory(
        &self,
        scope: &str,
        children: &[Summary],
    ) -> Result<Summary, OracleError> {
        let mut sorted: Vec<&Summary> = children.iter().collect();
        sorted.sort_by(|a, b| a.scope_path.cmp(&b.scope_path));

        let parts: Vec<String> = sorted
            .iter()
            .map(|s| {
                let kind = match s.level {
                    SummaryLevel::Directory => "Directory",
                    _ => "File",
                };
                format!("{}: {}\nSummary: {}\n", kind, display_path(&s.scope_path), s.text)
            })
            .collect();
        let header = format!(
            "Directory: {}\n\nHere are the summaries of its members. Please provide a concise \
             overview of this directory's purpose and logic.\n\n",
            display_path(scope)
        );
        let text = self
            .fold(&header, parts, DIRECTORY_PROMPT, self.settings.directory_tokens)
            .await?;
        Ok(summary(scope, SummaryLevel::Directory, text))
    }

    /// Summarize every directory of `tree` bottom-up from `file_summaries`.
    pub async fn aggregate_tree(
        &self,
        tree: &DirTree,
        file_summaries: &BTreeMap<String, Summary>,
    ) -> Result<TreeSummary, OracleError> {
        let mut done: BTreeMap<usize, Summary> = BTreeMap::new();

        for depth in (0..=tree.max_depth()).rev() {
            let level: Vec<usize> = tree.nodes_at_depth(depth).collect();
            let results = try_join_all(level.iter().map(|&idx| {
                let node = &tree.nodes[idx];
                let children: Vec<Summary> = node
                    .files
                    .iter()
                    .filter_map(|f| file_summaries.get(f).cloned())
                    .chain(node.children.iter().filter_map(|c| done.get(c).cloned()))
                    .collect();
                async move { self.aggregate_directory(&node.path, &children).await }
            }))
            .await?;
            for (idx, s) in level.into_iter().zip(results) {
                tracing::debug!(directory = %display_path(&s.scope_path), "summarized directory");
                done.insert(idx, s);
            }
        }

        let root = done
            .remove(&DirTree::ROOT)
            .unwrap_or_else(|| summary("", SummaryLevel::Directory, String::new()));
        let directories = done
            .into_values()
            .chain(std::iter::once(root.clone()))
            .map(|s| (s.scope_path.clone(), s))
            .collect();
        Ok(TreeSummary { root, directories })
    }

    /// Summarize one chunk. On `BudgetExceeded` the chunk is re-chunked once
    /// at half its size; a second overflow is returned to the caller.
    async fn summarize_chunk(&self, chunk: &Chunk) -> Result<Summary, OracleError> {
        let scope = format!("{}#{}", chunk.source_path, chunk.index);
        match self.summarize_text(chunk.index, &chunk.text).await {
            Ok(text) => Ok(summary(&scope, SummaryLevel::Chunk, text)),
            Err(OracleError::BudgetExceeded { estimated, limit }) => {
                tracing::warn!(
                    path = %chunk.source_path,
                    chunk = chunk.index,
                    estimated,
                    limit,
                    "chunk over oracle budget, re-chunking"
                );
                let pieces = chunk_text(
                    &chunk.source_path,
                    &chunk.text,
                    (chunk.approx_tokens.min(self.settings.max_tokens) / 2).max(1),
                    1,
                );
                let texts =
                    try_join_all(pieces.iter().map(|p| self.summarize_text(chunk.index, &p.text)))
                        .await?;
                Ok(summary(&scope, SummaryLevel::Chunk, texts.join("\n")))
            }
            Err(e) => Err(e),
        }
    }

    async fn summarize_text(&self, index: usize, text: &str) -> Result<String, OracleError> {
        let content = format!("File chunk {}:\n\n{}\n\nSummarize it concisely.", index + 1, text);
        self.oracle
            .summarize(
                &content,
                CHUNK_PROMPT,
                self.settings.summary_tokens,
                self.settings.temperature,
            )
            .await
    }

    /// Fold ordered `parts` into one text, pre-summarizing in batches while
    /// the concatenation exceeds the input budget. No call is ever sent with
    /// more than `max_tokens` of input.
    async fn fold(
        &self,
        header: &str,
        mut parts: Vec<String>,
        instructions: &str,
        output_tokens: usize,
    ) -> Result<String, OracleError> {
        let budget = self.settings.max_tokens.saturating_sub(estimate_tokens(header)).max(1);
        let mut total = estimate_tokens(&parts.join("\n"));

        while total > budget {
            let batches = pack_batches(&parts, budget);
            let oversized = batches.iter().map(|b| estimate_tokens(b)).find(|&t| t > budget);
            if let Some(estimated) = oversized {
                return Err(OracleError::BudgetExceeded {
                    estimated,
                    limit: budget,
                });
            }
            // When no two parts share a batch, each is condensed to an even share.
            let cap = if batches.len() < parts.len() {
                output_tokens
            } else {
                (budget / batches.len()).saturating_sub(PART_LABEL_TOKENS).max(1)
            };
            tracing::debug!(
                parts = parts.len(),
                batches = batches.len(),
                cap,
                "folding in batches"
            );
            let condensed = try_join_all(batches.iter().map(|batch| {
                self.oracle
                    .summarize(batch, BATCH_PROMPT, cap, self.settings.temperature)
            }))
            .await?;
            parts = condensed
                .into_iter()
                .enumerate()
                .map(|(i, s)| format!("Part {} summary: {}", i + 1, s))
                .collect();

            let condensed_total = estimate_tokens(&parts.join("\n"));
            if condensed_total >= total {
                return Err(OracleError::BudgetExceeded {
                    estimated: condensed_total,
                    limit: budget,
                });
            }
            total = condensed_total;
        }

        let content = format!("{}{}", header, parts.join("\n"));
        self.oracle
            .summarize(&content, instructions, output_tokens, self.settings.temperature)
            .await
    }
}

/// Greedily pack consecutive `parts` into newline-joined batches of at most
/// `budget` estimated tokens. A part larger than the budget forms its own batch.
pub fn pack_batches(parts: &[String], budget: usize) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    for part in parts {
        if !current.is_empty() && estimate_tokens(&current) + 1 + estimate_tokens(part) > budget {
            batches.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(part);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

fn summary(scope: &str, level: SummaryLevel, text: String) -> Summary {
    Summary {
        scope_path: scope.to_string(),
        level,
        token_count: estimate_tokens(&text),
        text,
    }
}

/// Human form of a scope path; the root is shown as `.`.
pub fn display_path(scope: &str) -> &str {
    if scope.is_empty() {
        "."
    } else {
        scope
    }
}

/// Root summary plus every directory summary, keyed by directory path.
#[derive(Debug, Clone)]
pub struct TreeSummary {
    pub root: Summary,
    pub directories: BTreeMap<String, Summary>,
}

/// A directory in the arena.
#[derive(Debug, Clone)]
pub struct DirNode {
    /// Root-relative path; the root is `""`.
    pub path: String,
    pub depth: usize,
    /// Subdirectory node indices, in path order.
    pub children: Vec<usize>,
    /// Root-relative paths of the files directly inside.
    pub files: Vec<String>,
}

/// Arena-indexed directory hierarchy built from file paths.
#[derive(Debug, Clone)]
pub struct DirTree {
    pub nodes: Vec<DirNode>,
}

impl DirTree {
    pub const ROOT: usize = 0;

    /// Build the hierarchy containing every `/`-separated file path.
    pub fn from_files<'a>(paths: impl IntoIterator<Item = &'a str>) -> Self {
        let mut tree = Self {
            nodes: vec![DirNode {
                path: String::new(),
                depth: 0,
                children: Vec::new(),
                files: Vec::new(),
            }],
        };
        let mut index: BTreeMap<String, usize> = BTreeMap::new();
        index.insert(String::new(), Self::ROOT);

        for path in paths {
            let mut parent = Self::ROOT;
            let mut prefix = String::new();
            let dirs: Vec<&str> = match path.rsplit_once('/') {
                Some((dir, _)) => dir.split('/').collect(),
                None => Vec::new(),
            };
            for (depth, dir) in dirs.iter().enumerate() {
                if !prefix.is_empty() {
                    prefix.push('/');
                }
                prefix.push_str(dir);
                parent = match index.get(&prefix) {
                    Some(&idx) => idx,
                    None => {
                        let idx = tree.nodes.len();
                        tree.nodes.push(DirNode {
                            path: prefix.clone(),
                            depth: depth + 1,
                            children: Vec::new(),
                            files: Vec::new(),
                        });
                        tree.nodes[parent].children.push(idx);
                        index.insert(prefix.clone(), idx);
                        idx
                    }
                };
            }
            tree.nodes[parent].files.push(path.to_string());
        }

        for node in &mut tree.nodes {
            node.files.sort();
        }
        let paths: Vec<String> = tree.nodes.iter().map(|n| n.path.clone()).collect();
        for node in &mut tree.nodes {
            node.children.sort_by(|a, b| paths[*a].cmp(&paths[*b]));
        }
        tree
    }

    pub fn max_depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    pub fn nodes_at_depth(&self, depth: usize) -> impl Iterator<Item = usize> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.depth == depth)
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Oracle, OracleRequest, RetryPolicy};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers with a short tag and records every request.
    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<OracleRequest>>,
        budget: Option<usize>,
    }

    #[async_trait]
    impl Oracle for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn complete(&self, request: &OracleRequest) -> Result<String, OracleError> {
            let estimated = estimate_tokens(&request.content);
            if let Some(limit) = self.budget {
                if estimated > limit {
                    return Err(OracleError::BudgetExceeded { estimated, limit });
                }
            }
            let mut requests = self.requests.lock().unwrap();
            requests.push(request.clone());
            Ok(format!("S{}", requests.len()))
        }
    }

    fn aggregator(oracle: Arc<Recorder>, max_tokens: usize) -> Aggregator {
        let adapter = OracleAdapter::new(
            oracle,
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::ZERO,
            },
            4,
        );
        Aggregator::new(
            Arc::new(adapter),
            AggregateSettings {
                max_tokens,
                summary_tokens: 50,
                directory_tokens: 50,
                temperature: 0.0,
            },
        )
    }

    fn chunk(path: &str, index: usize, text: &str) -> Chunk {
        Chunk {
            source_path: path.to_string(),
            index,
            text: text.to_string(),
            approx_tokens: estimate_tokens(text),
            oversized: false,
            findings: Vec::new(),
        }
    }

    fn file_summary(path: &str, text: &str) -> Summary {
        summary(path, SummaryLevel::File, text.to_string())
    }

    #[tokio::test]
    async fn test_file_fold_preserves_chunk_order() {
        let oracle = Arc::new(Recorder::default());
        let agg = aggregator(oracle.clone(), 1000);
        let chunks = vec![chunk("a.rs", 0, "first\n"), chunk("a.rs", 1, "second\n")];
        let s = agg.aggregate_file("a.rs", &chunks).await.unwrap();
        assert_eq!(s.level, SummaryLevel::File);

        let requests = oracle.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        let fold = &requests[2].content;
        let c1 = fold.find("Chunk 1 summary").unwrap();
        let c2 = fold.find("Chunk 2 summary").unwrap();
        assert!(c1 < c2);
    }

    #[tokio::test]
    async fn test_single_chunk_and_empty_file() {
        let oracle = Arc::new(Recorder::default());
        let agg = aggregator(oracle.clone(), 1000);
        agg.aggregate_file("a.rs", &[chunk("a.rs", 0, "x\n")]).await.unwrap();
        assert_eq!(oracle.requests.lock().unwrap().len(), 1);

        let empty = agg.aggregate_file("b.rs", &[]).await.unwrap();
        assert_eq!(empty.text, "(empty file)");
        assert_eq!(oracle.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_directory_fold_sorted_regardless_of_input_order() {
        let oracle = Arc::new(Recorder::default());
        let agg = aggregator(oracle.clone(), 1000);
        let a = file_summary("src/a.rs", "alpha");
        let b = file_summary("src/b.rs", "beta");
        let c = summary("src/sub", SummaryLevel::Directory, "gamma".to_string());

        agg.aggregate_directory("src", &[c.clone(), b.clone(), a.clone()])
            .await
            .unwrap();
        agg.aggregate_directory("src", &[a, c, b]).await.unwrap();

        let requests = oracle.requests.lock().unwrap();
        assert_eq!(requests[0].content, requests[1].content);
        let content = &requests[0].content;
        assert!(content.find("alpha").unwrap() < content.find("beta").unwrap());
        assert!(content.find("beta").unwrap() < content.find("gamma").unwrap());
        assert!(content.contains("Directory: src/sub"));
    }

    #[tokio::test]
    async fn test_fold_batches_when_over_budget() {
        let oracle = Arc::new(Recorder::default());
        let agg = aggregator(oracle.clone(), 120);
        let children: Vec<Summary> = (0..12)
            .map(|i| file_summary(&format!("f{:02}.rs", i), &"word ".repeat(20)))
            .collect();
        agg.aggregate_directory("", &children).await.unwrap();

        let requests = oracle.requests.lock().unwrap();
        assert!(requests.len() > 1);
        for r in requests.iter() {
            assert!(estimate_tokens(&r.content) <= 120, "fold input over budget");
        }
        assert_eq!(requests.last().unwrap().instructions, DIRECTORY_PROMPT);
        assert!(requests[..requests.len() - 1]
            .iter()
            .all(|r| r.instructions == BATCH_PROMPT));
    }

    #[tokio::test]
    async fn test_fold_condenses_parts_that_never_share_a_batch() {
        let oracle = Arc::new(Recorder::default());
        let agg = aggregator(oracle.clone(), 300);
        let children: Vec<Summary> = (0..3)
            .map(|i| file_summary(&format!("f{}.rs", i), &"z".repeat(800)))
            .collect();
        agg.aggregate_directory("", &children).await.unwrap();

        let requests = oracle.requests.lock().unwrap();
        let sizes: Vec<usize> = requests.iter().map(|r| estimate_tokens(&r.content)).collect();
        assert!(sizes.iter().all(|&t| t <= 300), "fold input over budget: {:?}", sizes);
        assert_eq!(requests.len(), 4);
        assert!(requests[..3].iter().all(|r| r.instructions == BATCH_PROMPT));
        assert!(requests[..3].iter().all(|r| r.max_output_tokens < 100));
        assert_eq!(requests[3].instructions, DIRECTORY_PROMPT);
    }

    #[tokio::test]
    async fn test_single_part_over_budget_is_not_sent() {
        let oracle = Arc::new(Recorder::default());
        let agg = aggregator(oracle.clone(), 300);
        let child = file_summary("huge.rs", &"z".repeat(2000));
        let err = agg.aggregate_directory("", &[child]).await.unwrap_err();
        assert!(matches!(err, OracleError::BudgetExceeded { .. }));
        assert!(oracle.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_budget_exceeded_rechunks_once() {
        let oracle = Arc::new(Recorder {
            budget: Some(40),
            ..Default::default()
        });
        let agg = aggregator(oracle.clone(), 40);
        let text = "0123456789abcdef\n".repeat(8);
        let s = agg.aggregate_file("big.txt", &[chunk("big.txt", 0, &text)]).await.unwrap();
        assert!(s.text.contains('\n'));
        assert!(oracle.requests.lock().unwrap().len() >= 2);
    }

    #[tokio::test]
    async fn test_budget_exceeded_twice_is_fatal() {
        let oracle = Arc::new(Recorder {
            budget: Some(10),
            ..Default::default()
        });
        let agg = aggregator(oracle, 10);
        let line = "y".repeat(200);
        let err = agg
            .aggregate_file("big.txt", &[chunk("big.txt", 0, &line)])
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::BudgetExceeded { .. }));
    }

    #[test]
    fn test_dir_tree_arena() {
        let tree = DirTree::from_files([
            "b.txt",
            "src/z.rs",
            "src/a/x.rs",
            "README.md",
            "docs/guide.md",
        ]);
        let root = &tree.nodes[DirTree::ROOT];
        assert_eq!(root.files, vec!["README.md", "b.txt"]);
        let child_paths: Vec<&str> = root
            .children
            .iter()
            .map(|&c| tree.nodes[c].path.as_str())
            .collect();
        assert_eq!(child_paths, vec!["docs", "src"]);
        assert_eq!(tree.max_depth(), 2);
        let deepest: Vec<&str> = tree
            .nodes_at_depth(2)
            .map(|i| tree.nodes[i].path.as_str())
            .collect();
        assert_eq!(deepest, vec!["src/a"]);
    }

    #[tokio::test]
    async fn test_tree_bottom_up() {
        let oracle = Arc::new(Recorder::default());
        let agg = aggregator(oracle.clone(), 1000);
        let files = ["src/a/x.rs", "src/z.rs", "top.txt"];
        let tree = DirTree::from_files(files);
        let summaries: BTreeMap<String, Summary> = files
            .iter()
            .map(|f| (f.to_string(), file_summary(f, &format!("about {}", f))))
            .collect();

        let result = agg.aggregate_tree(&tree, &summaries).await.unwrap();
        assert_eq!(result.root.scope_path, "");
        let keys: Vec<&str> = result.directories.keys().map(|k| k.as_str()).collect();
        assert_eq!(keys, vec!["", "src", "src/a"]);

        let requests = oracle.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].content.starts_with("Directory: src/a"));
        assert!(requests[1].content.starts_with("Directory: src\n"));
        assert!(requests[2].content.starts_with("Directory: ."));
        // Directory folds see summaries, not raw content.
        assert!(requests[2].content.contains("Directory: src\nSummary: S2"));
    }

    #[test]
    fn test_pack_batches_deterministic() {
        let parts: Vec<String> = (0..10).map(|i| format!("{}{}", i, "x".repeat(39))).collect();
        let a = pack_batches(&parts, 25);
        let b = pack_batches(&parts, 25);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        assert_eq!(a.join("\n"), parts.join("\n"));
    }
}
