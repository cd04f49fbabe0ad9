//! # docweave CLI
//!
//! The `docweave` binary regenerates a repository's README from its source
//! tree, skipping all work when the tree has not changed.
//!
//! ## Usage
//!
//! ```bash
//! docweave --config ./docweave.toml <command> [root] [flags]
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docweave generate` | Summarize the tree and write the merged README |
//! | `docweave check` | Print `stale` or `up to date`; no model calls, no writes |
//! | `docweave tools` | List toolchains found by the static signature table |
//!
//! ## Examples
//!
//! ```bash
//! # Regenerate ./README.md, merging with what is already there
//! docweave generate .
//!
//! # Keep the current README and add the analysis after it
//! docweave generate . --append --ignore dist --ignore-ext .lock
//!
//! # Use a template and force regeneration
//! docweave generate . --template docs/readme.template --force
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use docweave::config::{self, OutputMode, RunOptions};
use docweave::oracle::{create_oracle, DisabledOracle};
use docweave::pipeline::{Pipeline, RunOutcome, RunReport};
use docweave::progress::ProgressMode;

/// docweave: incremental README regeneration.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. A missing file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "docweave",
    about = "docweave: incremental README regeneration from a source tree",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docweave.toml")]
    config: PathBuf,

    /// Debug-level logging (ignored when RUST_LOG is set).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the tree and write the merged README.
    ///
    /// Does nothing when the digest file shows no change since the last
    /// successful run, unless `--force` is given.
    Generate {
        #[command(flatten)]
        run: RunArgs,

        /// Progress on stderr. Defaults to human when stderr is a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Report whether regeneration is needed.
    Check {
        #[command(flatten)]
        run: RunArgs,
    },

    /// List detected tools without calling the model.
    Tools {
        #[command(flatten)]
        run: RunArgs,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Repository root.
    #[arg(default_value = ".")]
    root: PathBuf,

    /// Output file. Defaults to `<root>/README.md`.
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Existing documentation to merge. Defaults to the output file.
    #[arg(long)]
    existing_doc: Option<PathBuf>,

    /// Template with section headings. Defaults to `<root>/readme.template`.
    #[arg(long)]
    template: Option<PathBuf>,

    /// Add the generated document after the existing content.
    #[arg(long, conflicts_with = "overwrite")]
    append: bool,

    /// Replace the output file (the default).
    #[arg(long)]
    overwrite: bool,

    /// Output token budget for final-document sections.
    #[arg(long, default_value_t = 1500)]
    max_tokens: usize,

    #[arg(long, default_value_t = 0.3)]
    temperature: f32,

    /// Regenerate even if nothing changed.
    #[arg(long)]
    force: bool,

    /// Path or glob to ignore (repeatable).
    #[arg(long)]
    ignore: Vec<String>,

    /// File extension to ignore (repeatable).
    #[arg(long)]
    ignore_ext: Vec<String>,

    /// Digest file. Defaults to `<root>/readme.digests`.
    #[arg(long)]
    digest_file: Option<PathBuf>,

    /// Leave out the per-directory breakdown section.
    #[arg(long)]
    no_directory_summary: bool,
}

impl RunArgs {
    fn into_options(self) -> RunOptions {
        let mut options = RunOptions::new(self.root);
        if let Some(output) = self.output {
            options.output = output;
        }
        if let Some(template) = self.template {
            options.template = Some(template);
        }
        if let Some(digest_file) = self.digest_file {
            options.digest_file = digest_file;
        }
        options.existing_doc = self.existing_doc;
        options.mode = if self.append {
            OutputMode::Append
        } else {
            OutputMode::Overwrite
        };
        options.max_tokens = self.max_tokens;
        options.temperature = self.temperature;
        options.force = self.force;
        options.ignore = self.ignore;
        options.ignore_ext = self.ignore_ext;
        options.directory_summary = !self.no_directory_summary;
        options
    }
}

fn setup_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn print_report(report: &RunReport) {
    match &report.outcome {
        RunOutcome::UpToDate => {
            println!("No changes detected ({} files). Skipping generation.", report.files);
        }
        RunOutcome::Regenerated {
            output,
            digest_version,
        } => {
            println!(
                "Wrote {} ({} files, {} chunks, {} model calls, digest v{}).",
                output.display(),
                report.files,
                report.chunks,
                report.oracle_calls,
                digest_version
            );
        }
    }

    if !report.warnings.is_empty() {
        eprintln!("{} warning(s):", report.warnings.len());
        for warning in &report.warnings {
            eprintln!("  - {}", warning);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Generate { run, progress } => {
            let oracle = create_oracle(&cfg.oracle)?;
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let pipeline =
                Pipeline::new(cfg, run.into_options(), oracle).with_progress(progress.reporter());
            let report = pipeline.run().await?;
            print_report(&report);
        }
        Commands::Check { run } => {
            let pipeline = Pipeline::new(cfg, run.into_options(), Arc::new(DisabledOracle));
            if pipeline.check()? {
                println!("stale");
            } else {
                println!("up to date");
            }
        }
        Commands::Tools { run } => {
            let pipeline = Pipeline::new(cfg, run.into_options(), Arc::new(DisabledOracle));
            let detection = pipeline.static_tools()?;
            if detection.known.is_empty() && detection.unknown.is_empty() {
                println!("No tools detected.");
            }
            for tool in detection.known.values() {
                println!("{}\t{}", tool.name, tool.basis);
            }
            for signature in &detection.unknown {
                println!("{}\tunrecognised (resolved by the model during generate)", signature);
            }
        }
    }

    Ok(())
}
