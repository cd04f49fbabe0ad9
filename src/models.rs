//! Core data models used throughout docweave.
//!
//! These types represent the files, chunks, summaries and document sections
//! that flow through the regeneration pipeline.

use std::fmt;

/// A textual file produced by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Path relative to the walk root, `/`-separated.
    pub path: String,
    pub content: String,
}

/// A contiguous, line-aligned piece of one file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub source_path: String,
    /// Ordinal within the file, contiguous from 0.
    pub index: usize,
    /// Exact slice of the file content, line terminators included.
    pub text: String,
    pub approx_tokens: usize,
    /// Set when a single line alone exceeds the chunk budget.
    pub oversized: bool,
    /// Annotated lines that landed in this chunk.
    pub findings: Vec<AnnotatedFinding>,
}

/// Level at which a [`Summary`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SummaryLevel {
    Chunk,
    File,
    Directory,
}

impl fmt::Display for SummaryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryLevel::Chunk => write!(f, "chunk"),
            SummaryLevel::File => write!(f, "file"),
            SummaryLevel::Directory => write!(f, "directory"),
        }
    }
}

/// Oracle-produced text describing a chunk, file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// File or directory path relative to the root. The root is `""`.
    pub scope_path: String,
    pub level: SummaryLevel,
    pub text: String,
    pub token_count: usize,
}

/// A line carrying the `!important` marker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AnnotatedFinding {
    pub source_path: String,
    /// 1-based line number within the file.
    pub line_number: usize,
    /// The line without its terminator.
    pub raw_line: String,
}

/// How a tool was recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionBasis {
    /// Matched the static signature table (extension or file name).
    Signature(String),
    /// Unknown infra-like signature explained by the oracle.
    Oracle(String),
}

impl fmt::Display for DetectionBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionBasis::Signature(sig) => write!(f, "signature {}", sig),
            DetectionBasis::Oracle(sig) => write!(f, "oracle for {}", sig),
        }
    }
}

/// A toolchain the project needs, with installation instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolEntry {
    pub name: String,
    pub basis: DetectionBasis,
    /// Markdown body rendered under the tool's heading.
    pub install_instructions: String,
}

/// A heading-delimited section of a Markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Heading text without the leading `#`s.
    pub heading: String,
    pub level: usize,
    /// Everything between this heading and the next split heading.
    pub body: String,
}

impl Section {
    pub fn new(heading: impl Into<String>, level: usize, body: impl Into<String>) -> Self {
        Self {
            heading: heading.into(),
            level,
            body: body.into(),
        }
    }

    /// Identity used to match sections across documents: case-insensitive,
    /// whitespace-collapsed heading text. Level-1 headings all map to the
    /// title slot.
    pub fn identity(&self) -> String {
        if self.level == 1 {
            return "#title".to_string();
        }
        heading_identity(&self.heading)
    }

    /// Markdown rendition: heading line followed by the body.
    pub fn render(&self) -> String {
        let mut out = format!("{} {}\n", "#".repeat(self.level.max(1)), self.heading);
        let body = self.body.trim_matches('\n');
        if !body.is_empty() {
            out.push('\n');
            out.push_str(body);
            out.push('\n');
        }
        out
    }
}

/// Normalize heading text for identity comparison.
pub fn heading_identity(heading: &str) -> String {
    heading
        .trim()
        .trim_end_matches('#')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Where a new section is rendered relative to preserved old sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Position dictated by the template (or the default order).
    Templated,
    /// License/footer, rendered after preserved sections.
    Footer,
}

/// A section produced this run together with its placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedSection {
    pub section: Section,
    pub placement: Placement,
}

/// Result of the merge engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedDocument {
    /// Text before the first heading of the old document, kept verbatim.
    pub preamble: Option<String>,
    /// Sections produced this run, in template order.
    pub new_sections: Vec<PlacedSection>,
    /// Old-only sections, in their original order.
    pub preserved_old_sections: Vec<Section>,
}

impl MergedDocument {
    /// Headings in final rendering order.
    pub fn headings(&self) -> Vec<String> {
        self.ordered().into_iter().map(|s| s.heading.clone()).collect()
    }

    fn ordered(&self) -> Vec<&Section> {
        let placed = |p: Placement| {
            self.new_sections
                .iter()
                .filter(move |s| s.placement == p)
                .map(|s| &s.section)
        };
        placed(Placement::Templated)
            .chain(self.preserved_old_sections.iter())
            .chain(placed(Placement::Footer))
            .collect()
    }

    /// Serialize to Markdown.
    pub fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(preamble) = &self.preamble {
            let trimmed = preamble.trim_matches('\n');
            if !trimmed.is_empty() {
                parts.push(format!("{}\n", trimmed));
            }
        }
        parts.extend(self.ordered().into_iter().map(Section::render));
        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_normalizes_case_and_spacing() {
        let a = Section::new("Custom   Notes", 2, "");
        let b = Section::new("custom notes ##", 2, "");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_title_identity_ignores_text() {
        let a = Section::new("my-project", 1, "");
        let b = Section::new("Title", 1, "");
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_render_order() {
        let doc = MergedDocument {
            preamble: None,
            new_sections: vec![
                PlacedSection {
                    section: Section::new("License", 2, "MIT"),
                    placement: Placement::Footer,
                },
                PlacedSection {
                    section: Section::new("Title", 1, ""),
                    placement: Placement::Templated,
                },
                PlacedSection {
                    section: Section::new("Usage", 2, "x"),
                    placement: Placement::Templated,
                },
            ],
            preserved_old_sections: vec![Section::new("Custom Notes", 2, "keep")],
        };
        assert_eq!(
            doc.headings(),
            vec!["Title", "Usage", "Custom Notes", "License"]
        );
        let text = doc.render();
        assert!(text.starts_with("# Title\n"));
        assert!(text.contains("## Custom Notes\n\nkeep\n"));
    }
}
