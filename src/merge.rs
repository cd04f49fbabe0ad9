//! Section-aware README merge.
//!
//! The merge engine builds the new set of sections for this run from the
//! aggregate summary, the detected tools and the annotated findings, then
//! reconciles them with the existing document:
//!
//! | Case                          | Result                                      |
//! |-------------------------------|---------------------------------------------|
//! | Section only in the old doc   | Preserved verbatim, original relative order |
//! | Section only in the new set   | Inserted at its template/default position   |
//! | In both, old adds nothing     | New body wins                               |
//! | In both, old has unique lines | Oracle merges; empty answer → new body wins |
//!
//! Documents are split at level-1 and level-2 ATX headings outside fenced
//! code blocks. Deeper headings stay inside their parent's body. Every
//! level-1 heading maps to the title slot.
//!
//! When a template is supplied its headings are authoritative for order.
//! Detected tools and annotated findings always get a section; if the
//! template names none for them, one follows the templated sections.
//! Without a template the default order is title, description,
//! installation, usage, directory breakdown, annotated code and license.
//! The annotated-code section is rebuilt from the current findings and is
//! never merged with its previous body.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::try_join_all;

use crate::aggregate::display_path;
use crate::config::OutputMode;
use crate::digest::write_atomic;
use crate::models::{
    AnnotatedFinding, MergedDocument, PlacedSection, Placement, Section, Summary, ToolEntry,
};
use crate::oracle::{OracleAdapter, OracleError};
use crate::tools::render_install_section;

/// Deepest heading level that starts a new section.
const SPLIT_LEVEL: usize = 2;

/// Heading inserted before generated content in append mode.
pub const APPEND_SEPARATOR: &str = "## AI-Generated Repository Analysis";

const MERGE_PROMPT: &str = "You merge two versions of one README section. \
    Keep every fact from the old version that the new version does not cover. \
    Where they conflict, prefer the new version. Output only the merged Markdown \
    body, without the section heading.";

const SECTION_PROMPT: &str = "You write one section of a project README from a \
    summary of the repository. Output only the Markdown body, without the \
    section heading.";

const FINDINGS_PROMPT: &str = "You summarize lines that developers marked as \
    important in a codebase. Explain in a short paragraph what a reader of the \
    README should take away from them.";

/// A parsed Markdown document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDoc {
    /// Text before the first split heading.
    pub preamble: String,
    pub sections: Vec<Section>,
}

/// Split `text` into a preamble and level ≤ 2 sections.
pub fn parse_sections(text: &str) -> ParsedDoc {
    let mut doc = ParsedDoc::default();
    let mut current: Option<Section> = None;
    let mut fence: Option<&str> = None;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if let Some(marker) = fence {
            if trimmed.starts_with(marker) {
                fence = None;
            }
        } else if trimmed.starts_with("```") {
            fence = Some("```");
        } else if trimmed.starts_with("~~~") {
            fence = Some("~~~");
        } else if let Some((level, heading)) = parse_heading(line) {
            if level <= SPLIT_LEVEL {
                if let Some(done) = current.take() {
                    doc.sections.push(done);
                }
                current = Some(Section::new(heading, level, ""));
                continue;
            }
        }

        match current.as_mut() {
            Some(section) => section.body.push_str(line),
            None => doc.preamble.push_str(line),
        }
    }

    if let Some(done) = current {
        doc.sections.push(done);
    }
    doc
}

/// `(level, text)` for an ATX heading line.
fn parse_heading(line: &str) -> Option<(usize, &str)> {
    let line = line.trim_end();
    let level = line.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &line[level..];
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return None;
    }
    Some((level, rest.trim().trim_end_matches('#').trim_end()))
}

/// Built-in section kinds the engine knows how to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionKind {
    Title,
    Description,
    Installation,
    Usage,
    DirectoryBreakdown,
    AnnotatedCode,
    License,
    /// Template heading with no built-in generator; the template body is
    /// used as instructions.
    Custom,
}

impl SectionKind {
    fn classify(section: &Section) -> Self {
        if section.level == 1 {
            return SectionKind::Title;
        }
        match section.identity().as_str() {
            "description" | "overview" | "about" | "summary" => SectionKind::Description,
            "installation" | "install" | "setup" | "getting started" => {
                SectionKind::Installation
            }
            "usage" | "how to use" => SectionKind::Usage,
            "directory breakdown" | "directory structure" | "project structure" => {
                SectionKind::DirectoryBreakdown
            }
            "custom-annotated code" | "annotated code" | "important notes" => {
                SectionKind::AnnotatedCode
            }
            "license" | "licence" => SectionKind::License,
            _ => SectionKind::Custom,
        }
    }
}

/// One section position to fill this run.
#[derive(Debug, Clone)]
struct Slot {
    kind: SectionKind,
    heading: String,
    level: usize,
    /// Template body for this heading, if any.
    guidance: String,
    /// Title slot that carries the summary because no description slot exists.
    leads_with_summary: bool,
    placement: Placement,
}

impl Slot {
    fn builtin(kind: SectionKind, heading: &str, level: usize) -> Self {
        Self {
            kind,
            heading: heading.to_string(),
            level,
            guidance: String::new(),
            leads_with_summary: false,
            placement: if kind == SectionKind::License {
                Placement::Footer
            } else {
                Placement::Templated
            },
        }
    }
}

/// Everything the engine reads.
#[derive(Debug, Clone, Copy)]
pub struct MergeInputs<'a> {
    /// Fallback title when the old document has none.
    pub project_name: &'a str,
    pub old_doc: Option<&'a str>,
    pub template: Option<&'a str>,
    /// Contents of `repo.intro`, placed ahead of the description.
    pub intro: Option<&'a str>,
    pub aggregate: &'a Summary,
    pub tools: &'a BTreeMap<String, ToolEntry>,
    pub findings: &'a [AnnotatedFinding],
    /// Per-directory summaries; `None` when the breakdown is switched off.
    pub directories: Option<&'a BTreeMap<String, Summary>>,
}

/// Merged document plus the sections that fell back on a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub document: MergedDocument,
    /// Headings where the oracle returned nothing and the new body won.
    pub conflicts: Vec<String>,
}

/// Reconciles generated sections with an existing document.
pub struct MergeEngine {
    oracle: Arc<OracleAdapter>,
    max_tokens: usize,
    temperature: f32,
}

impl MergeEngine {
    pub fn new(oracle: Arc<OracleAdapter>, max_tokens: usize, temperature: f32) -> Self {
        Self {
            oracle,
            max_tokens,
            temperature,
        }
    }

    /// Produce the merged document.
    ///
    /// # Errors
    ///
    /// Propagates the first fatal oracle failure. An empty merge answer is
    /// not an error; it is reported in [`MergeOutcome::conflicts`].
    pub async fn merge(&self, inputs: MergeInputs<'_>) -> Result<MergeOutcome, OracleError> {
        let old = parse_sections(inputs.old_doc.unwrap_or_default());
        let template = inputs.template.map(parse_sections);
        let slots = plan_slots(template.as_ref(), &old, &inputs);

        let mut claimed = HashSet::new();
        let pairs: Vec<(Slot, Option<&Section>)> = slots
            .into_iter()
            .map(|slot| {
                let identity = Section::new(slot.heading.as_str(), slot.level, "").identity();
                let matched = old
                    .sections
                    .iter()
                    .enumerate()
                    .find(|(i, s)| !claimed.contains(i) && s.identity() == identity);
                match matched {
                    Some((i, section)) => {
                        claimed.insert(i);
                        (slot, Some(section))
                    }
                    None => (slot, None),
                }
            })
            .collect();

        let resolved = try_join_all(
            pairs
                .iter()
                .map(|(slot, previous)| self.fill_slot(slot, *previous, &inputs)),
        )
        .await?;

        let mut new_sections = Vec::new();
        let mut conflicts = Vec::new();
        for resolved in resolved.into_iter().flatten() {
            if resolved.conflict {
                conflicts.push(resolved.section.section.heading.clone());
            }
            new_sections.push(resolved.section);
        }

        let preserved_old_sections = old
            .sections
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed.contains(i))
            .map(|(_, s)| s.clone())
            .collect();

        let preamble = Some(old.preamble).filter(|p| !p.trim().is_empty());

        Ok(MergeOutcome {
            document: MergedDocument {
                preamble,
                new_sections,
                preserved_old_sections,
            },
            conflicts,
        })
    }

    /// Generate the slot's body and reconcile it with the old section.
    /// `None` when the slot has nothing to contribute.
    async fn fill_slot(
        &self,
        slot: &Slot,
        previous: Option<&Section>,
        inputs: &MergeInputs<'_>,
    ) -> Result<Option<Resolved>, OracleError> {
        let fresh = self.generate(slot, inputs).await?;
        let Some(fresh) = fresh else {
            return Ok(previous.map(|old| Resolved {
                section: PlacedSection {
                    section: old.clone(),
                    placement: slot.placement,
                },
                conflict: false,
            }));
        };

        let heading = match (slot.kind, previous) {
            (SectionKind::Title, Some(old)) => old.heading.clone(),
            _ => slot.heading.clone(),
        };

        // Annotated code is rebuilt from the current findings only.
        let (body, conflict) = match previous {
            Some(old) if slot.kind != SectionKind::AnnotatedCode => {
                self.reconcile(&heading, &old.body, &fresh).await?
            }
            _ => (fresh, false),
        };

        Ok(Some(Resolved {
            section: PlacedSection {
                section: Section::new(heading, slot.level, body),
                placement: slot.placement,
            },
            conflict,
        }))
    }

    /// New body for `slot`, or `None` when there is nothing to generate.
    async fn generate(
        &self,
        slot: &Slot,
        inputs: &MergeInputs<'_>,
    ) -> Result<Option<String>, OracleError> {
        let body = match slot.kind {
            SectionKind::Title if slot.leads_with_summary => description_body(inputs),
            SectionKind::Title => String::new(),
            SectionKind::Description => description_body(inputs),
            SectionKind::Installation => render_install_section(inputs.tools),
            SectionKind::Usage => {
                let ask = format!(
                    "Write the '{}' section: how to build, run and use this project.\n\
                     {}\n\nRepository summary:\n{}",
                    slot.heading, slot.guidance, inputs.aggregate.text
                );
                self.ask(SECTION_PROMPT, &ask).await?
            }
            SectionKind::Custom => {
                let ask = format!(
                    "Write the '{}' section.\nInstructions: {}\n\nRepository summary:\n{}",
                    slot.heading,
                    slot.guidance.trim(),
                    inputs.aggregate.text
                );
                self.ask(SECTION_PROMPT, &ask).await?
            }
            SectionKind::DirectoryBreakdown => match inputs.directories {
                Some(dirs) => render_directories(dirs),
                None => return Ok(None),
            },
            SectionKind::AnnotatedCode => self.annotated_body(inputs.findings).await?,
            SectionKind::License => slot.guidance.trim().to_string(),
        };

        if body.trim().is_empty() && slot.kind != SectionKind::Title {
            return Ok(None);
        }
        Ok(Some(body))
    }

    async fn annotated_body(&self, findings: &[AnnotatedFinding]) -> Result<String, OracleError> {
        if findings.is_empty() {
            return Ok("No custom annotations found.".to_string());
        }
        let listing = findings
            .iter()
            .map(|f| {
                format!(
                    "- `{}:{}`: `{}`",
                    f.source_path,
                    f.line_number,
                    f.raw_line.trim()
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let summary = self.ask(FINDINGS_PROMPT, &listing).await?;
        Ok(format!("{}\n\n{}", listing, summary.trim()))
    }

    /// `(body, conflict)` for a section present in both documents.
    async fn reconcile(
        &self,
        heading: &str,
        old: &str,
        new: &str,
    ) -> Result<(String, bool), OracleError> {
        if old.trim().is_empty() || !has_unique_lines(old, new) {
            return Ok((new.to_string(), false));
        }
        if new.trim().is_empty() {
            return Ok((old.to_string(), false));
        }

        let content = format!(
            "Section: {}\n\nOld version:\n{}\n\nNew version:\n{}",
            heading,
            old.trim(),
            new.trim()
        );
        let merged = self.ask(MERGE_PROMPT, &content).await?;
        if merged.trim().is_empty() {
            tracing::warn!(section = heading, "merge returned no text; keeping new content");
            return Ok((new.to_string(), true));
        }
        Ok((merged, false))
    }

    async fn ask(&self, instructions: &str, content: &str) -> Result<String, OracleError> {
        let text = self
            .oracle
            .summarize(content, instructions, self.max_tokens, self.temperature)
            .await?;
        Ok(strip_code_fence(&text).to_string())
    }
}

struct Resolved {
    section: PlacedSection,
    conflict: bool,
}

/// Slots to fill this run. Tools and findings always get a section: when
/// the template names none for them, one is added after its own sections.
fn plan_slots(
    template: Option<&ParsedDoc>,
    old: &ParsedDoc,
    inputs: &MergeInputs<'_>,
) -> Vec<Slot> {
    let Some(template) = template.filter(|t| !t.sections.is_empty()) else {
        return default_slots(old, inputs);
    };

    let has_description = template
        .sections
        .iter()
        .any(|s| SectionKind::classify(s) == SectionKind::Description);

    let mut seen = HashSet::new();
    let mut slots = Vec::new();
    for section in &template.sections {
        if !seen.insert(section.identity()) {
            continue;
        }
        let kind = SectionKind::classify(section);
        let is_title = kind == SectionKind::Title;
        slots.push(Slot {
            kind,
            heading: if is_title {
                inputs.project_name.to_string()
            } else {
                section.heading.clone()
            },
            level: section.level,
            guidance: section.body.trim().to_string(),
            leads_with_summary: is_title && !has_description,
            placement: Placement::Templated,
        });
    }

    if !seen.contains("#title") {
        let mut title = Slot::builtin(SectionKind::Title, inputs.project_name, 1);
        title.leads_with_summary = !has_description;
        slots.insert(0, title);
    }

    let has_installation = slots.iter().any(|s| s.kind == SectionKind::Installation);
    if !inputs.tools.is_empty() && !has_installation {
        slots.push(Slot::builtin(SectionKind::Installation, "Installation", 2));
    }
    let has_annotated = slots.iter().any(|s| s.kind == SectionKind::AnnotatedCode);
    if !has_annotated {
        slots.extend(annotated_slot(old, inputs));
    }
    slots
}

/// The annotated-code slot, planned while findings exist or while the old
/// document still shows a previous run's findings.
fn annotated_slot(old: &ParsedDoc, inputs: &MergeInputs<'_>) -> Option<Slot> {
    let previous = old
        .sections
        .iter()
        .find(|s| SectionKind::classify(s) == SectionKind::AnnotatedCode);
    if inputs.findings.is_empty() && previous.is_none() {
        return None;
    }
    let heading = previous.map_or("Custom-Annotated Code", |s| s.heading.as_str());
    Some(Slot::builtin(SectionKind::AnnotatedCode, heading, 2))
}

fn default_slots(old: &ParsedDoc, inputs: &MergeInputs<'_>) -> Vec<Slot> {
    let mut slots = vec![
        Slot::builtin(SectionKind::Title, inputs.project_name, 1),
        Slot::builtin(SectionKind::Description, "Description", 2),
        Slot::builtin(SectionKind::Installation, "Installation", 2),
        Slot::builtin(SectionKind::Usage, "Usage", 2),
    ];
    if inputs.directories.is_some() {
        slots.push(Slot::builtin(
            SectionKind::DirectoryBreakdown,
            "Directory Breakdown",
            2,
        ));
    }
    slots.extend(annotated_slot(old, inputs));
    slots.push(Slot::builtin(SectionKind::License, "License", 2));
    slots
}

fn description_body(inputs: &MergeInputs<'_>) -> String {
    match inputs.intro.map(str::trim).filter(|i| !i.is_empty()) {
        Some(intro) => format!("{}\n\n{}", intro, inputs.aggregate.text.trim()),
        None => inputs.aggregate.text.trim().to_string(),
    }
}

fn render_directories(dirs: &BTreeMap<String, Summary>) -> String {
    dirs.iter()
        .filter(|(path, _)| !path.is_empty())
        .map(|(path, summary)| {
            format!("### `{}`\n\n{}\n", display_path(path), summary.text.trim())
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// True when `old` has a non-blank line that does not appear in `new`.
fn has_unique_lines(old: &str, new: &str) -> bool {
    let known: HashSet<&str> = new.lines().map(str::trim).collect();
    old.lines()
        .map(str::trim)
        .any(|line| !line.is_empty() && !known.contains(line))
}

/// Remove a fence that wraps the whole answer.
fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = inner.strip_suffix("```") else {
        return trimmed;
    };
    match inner.split_once('\n') {
        Some((lang, body)) if !lang.contains(' ') => body.trim(),
        _ => trimmed,
    }
}

/// Write the rendered document to `path`.
///
/// In [`OutputMode::Append`] the existing content at `path` is kept and the
/// new content follows [`APPEND_SEPARATOR`].
pub fn write_output(path: &Path, rendered: &str, mode: OutputMode) -> Result<()> {
    let text = match mode {
        OutputMode::Overwrite => rendered.to_string(),
        OutputMode::Append => {
            let existing = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()))
                }
            };
            if existing.trim().is_empty() {
                format!("{}\n\n{}", APPEND_SEPARATOR, rendered)
            } else {
                format!(
                    "{}\n\n{}\n\n{}",
                    existing.trim_end(),
                    APPEND_SEPARATOR,
                    rendered
                )
            }
        }
    };
    write_atomic(path, text.as_bytes())
}
