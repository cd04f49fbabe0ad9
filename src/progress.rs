//! Regeneration progress reporting.
//!
//! Reports observable progress during `docweave generate` so users see what
//! is being scanned, how many files are left to summarize, and when the
//! merge starts. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// A single progress event for a regeneration run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineProgressEvent {
    /// Walking the tree. Total unknown.
    Discovering { root: String },
    /// File summaries: n files done out of total.
    Summarizing { n: u64, total: u64 },
    /// Building directory summaries.
    Folding { directories: u64 },
    /// Reconciling with the existing document.
    Merging,
}

/// Reports pipeline progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the pipeline.
    fn report(&self, event: PipelineProgressEvent);
}

/// Human-friendly progress on stderr: "docweave  summarizing  12 / 1,340 files".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: PipelineProgressEvent) {
        let line = match &event {
            PipelineProgressEvent::Discovering { root } => {
                format!("docweave {}  discovering...\n", root)
            }
            PipelineProgressEvent::Summarizing { n, total } => format!(
                "docweave  summarizing  {} / {} files\n",
                format_number(*n),
                format_number(*total)
            ),
            PipelineProgressEvent::Folding { directories } => format!(
                "docweave  folding  {} directories\n",
                format_number(*directories)
            ),
            PipelineProgressEvent::Merging => "docweave  merging\n".to_string(),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: PipelineProgressEvent) {
        let obj = match &event {
            PipelineProgressEvent::Discovering { root } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "root": root
            }),
            PipelineProgressEvent::Summarizing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "summarizing",
                "n": n,
                "total": total
            }),
            PipelineProgressEvent::Folding { directories } => serde_json::json!({
                "event": "progress",
                "phase": "folding",
                "directories": directories
            }),
            PipelineProgressEvent::Merging => serde_json::json!({
                "event": "progress",
                "phase": "merging"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: PipelineProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(123_456), "123,456");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
