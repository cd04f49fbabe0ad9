//! Line-boundary text chunker.
//!
//! Splits a file's content into [`Chunk`]s that respect a `max_tokens`
//! budget. Lines are packed greedily; a line is never split, so a single
//! line longer than the budget becomes its own chunk flagged `oversized`.
//! Chunks keep their line terminators, so concatenating the chunk texts in
//! index order reproduces the file exactly.
//!
//! Lines containing [`IMPORTANT_MARKER`] are attached to the chunk they land
//! in as [`AnnotatedFinding`]s.

use crate::models::{AnnotatedFinding, Chunk, SourceUnit};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Marker that turns a line into an [`AnnotatedFinding`].
pub const IMPORTANT_MARKER: &str = "!important";

/// Estimated token count of `text`: characters / 4, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split `unit` into line-aligned chunks of at most `max_tokens` (estimated).
/// Empty content yields no chunks.
pub fn chunk_unit(unit: &SourceUnit, max_tokens: usize) -> Vec<Chunk> {
    chunk_text(&unit.path, &unit.content, max_tokens, 1)
}

/// Chunk `text` from `source_path`, numbering lines from `first_line`.
pub fn chunk_text(
    source_path: &str,
    text: &str,
    max_tokens: usize,
    first_line: usize,
) -> Vec<Chunk> {
    let max_tokens = max_tokens.max(1);
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut buf_tokens = 0usize;
    let mut findings = Vec::new();

    for (offset, line) in text.split_inclusive('\n').enumerate() {
        let line_tokens = estimate_tokens(line);

        if !buf.is_empty() && buf_tokens + line_tokens > max_tokens {
            chunks.push(make_chunk(
                source_path,
                chunks.len(),
                std::mem::take(&mut buf),
                max_tokens,
                std::mem::take(&mut findings),
            ));
        }

        if line.contains(IMPORTANT_MARKER) {
            findings.push(AnnotatedFinding {
                source_path: source_path.to_string(),
                line_number: first_line + offset,
                raw_line: line.trim_end_matches(['\n', '\r']).to_string(),
            });
        }

        buf.push_str(line);
        buf_tokens = estimate_tokens(&buf);
    }

    if !buf.is_empty() {
        chunks.push(make_chunk(source_path, chunks.len(), buf, max_tokens, findings));
    }

    chunks
}

/// All findings across `chunks`, in line order.
pub fn collect_findings(chunks: &[Chunk]) -> Vec<AnnotatedFinding> {
    chunks.iter().flat_map(|c| c.findings.iter().cloned()).collect()
}

fn make_chunk(
    source_path: &str,
    index: usize,
    text: String,
    max_tokens: usize,
    findings: Vec<AnnotatedFinding>,
) -> Chunk {
    let approx_tokens = estimate_tokens(&text);
    Chunk {
        source_path: source_path.to_string(),
        index,
        oversized: approx_tokens > max_tokens,
        approx_tokens,
        text,
        findings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(content: &str) -> SourceUnit {
        SourceUnit {
            path: "src/lib.rs".to_string(),
            content: content.to_string(),
        }
    }

    fn rejoin(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.text.as_str()).collect()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_unit(&unit("Hello, world!\n"), 700);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "Hello, world!\n");
        assert!(!chunks[0].oversized);
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_unit(&unit(""), 700).is_empty());
    }

    #[test]
    fn test_lossless_and_contiguous() {
        let text = (0..200)
            .map(|i| format!("line number {} with some padding\r\n", i))
            .collect::<String>()
            + "no trailing newline";
        let chunks = chunk_unit(&unit(&text), 25);
        assert!(chunks.len() > 1);
        assert_eq!(rejoin(&chunks), text);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i, "Index mismatch at position {}", i);
            assert!(c.approx_tokens <= 25 || c.oversized);
        }
    }

    #[test]
    fn test_never_splits_a_line() {
        let long = "x".repeat(400);
        let text = format!("short\n{}\nshort again\n", long);
        let chunks = chunk_unit(&unit(&text), 10);
        assert_eq!(rejoin(&chunks), text);
        let big: Vec<_> = chunks.iter().filter(|c| c.oversized).collect();
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].text, format!("{}\n", long));
    }

    #[test]
    fn test_greedy_packing() {
        // Each line is 8 chars => 2 tokens; budget 4 fits two lines.
        let text = "aaaaaaa\nbbbbbbb\nccccccc\nddddddd\neeeeeee\n";
        let chunks = chunk_unit(&unit(text), 4);
        let texts: Vec<_> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["aaaaaaa\nbbbbbbb\n", "ccccccc\nddddddd\n", "eeeeeee\n"]
        );
    }

    #[test]
    fn test_important_line_single_finding_at_any_boundary() {
        let mut lines: Vec<String> = (1..=40).map(|i| format!("filler line {}", i)).collect();
        lines[16] = "# !important: rotate secrets monthly".to_string();
        let text = lines.join("\n");

        for budget in [1, 3, 7, 12, 50, 10_000] {
            let chunks = chunk_unit(&unit(&text), budget);
            let findings = collect_findings(&chunks);
            assert_eq!(findings.len(), 1, "budget {}", budget);
            assert_eq!(findings[0].line_number, 17);
            assert_eq!(findings[0].raw_line, "# !important: rotate secrets monthly");
            assert_eq!(findings[0].source_path, "src/lib.rs");
        }
    }

    #[test]
    fn test_chunk_text_line_offset() {
        let chunks = chunk_text("a.txt", "one\n!important two\n", 100, 10);
        assert_eq!(collect_findings(&chunks)[0].line_number, 11);
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\nBeta\nGamma\nDelta\n";
        assert_eq!(chunk_unit(&unit(text), 2), chunk_unit(&unit(text), 2));
    }

    #[test]
    fn test_estimate_tokens_total() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
