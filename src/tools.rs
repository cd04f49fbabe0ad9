//! Tool detection.
//!
//! Maps file names and extensions to the toolchains a project needs, using a
//! fixed signature table with per-platform installation guides. Files that
//! match no signature but look like build or infrastructure artifacts are
//! grouped by signature (`*.nix`, `Jenkinsfile`, ...) and each distinct
//! signature is explained by one oracle call.

use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{DetectionBasis, ToolEntry};
use crate::oracle::{OracleAdapter, OracleError};

#[derive(Debug, Clone, Copy)]
enum Matcher {
    /// File name ends with the text (extensions, `Dockerfile`).
    Suffix(&'static str),
    /// File name equals the text.
    Name(&'static str),
    /// File name starts with the text (`Dockerfile.dev`).
    Prefix(&'static str),
}

impl Matcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            Matcher::Suffix(s) => name.ends_with(s),
            Matcher::Name(s) => name == *s,
            Matcher::Prefix(s) => name.starts_with(s),
        }
    }

    fn describe(&self) -> String {
        match self {
            Matcher::Suffix(s) if s.starts_with('.') => format!("*{}", s),
            Matcher::Suffix(s) | Matcher::Name(s) => s.to_string(),
            Matcher::Prefix(s) => format!("{}*", s),
        }
    }
}

/// Known signatures, checked in order; the first match wins.
const SIGNATURES: &[(Matcher, &str)] = &[
    (Matcher::Suffix(".py"), "Python"),
    (Matcher::Name("requirements.txt"), "Python"),
    (Matcher::Name("pyproject.toml"), "Python"),
    (Matcher::Suffix(".tf"), "Terraform"),
    (Matcher::Suffix(".sh"), "Bash/Shell"),
    (Matcher::Suffix(".js"), "Node.js / JavaScript"),
    (Matcher::Suffix(".mjs"), "Node.js / JavaScript"),
    (Matcher::Suffix(".cjs"), "Node.js / JavaScript"),
    (Matcher::Name("package.json"), "Node.js / JavaScript"),
    (Matcher::Suffix(".ts"), "TypeScript"),
    (Matcher::Suffix(".tsx"), "TypeScript"),
    (Matcher::Name("tsconfig.json"), "TypeScript"),
    (Matcher::Suffix("Dockerfile"), "Docker"),
    (Matcher::Prefix("Dockerfile."), "Docker"),
    (Matcher::Name("docker-compose.yml"), "Docker"),
    (Matcher::Name("docker-compose.yaml"), "Docker"),
    (Matcher::Name("compose.yaml"), "Docker"),
    (Matcher::Suffix(".rs"), "Rust"),
    (Matcher::Name("Cargo.toml"), "Rust"),
    (Matcher::Suffix(".go"), "Go"),
    (Matcher::Name("go.mod"), "Go"),
    (Matcher::Suffix(".rb"), "Ruby"),
    (Matcher::Name("Gemfile"), "Ruby"),
    (Matcher::Name("pom.xml"), "Maven"),
    (Matcher::Name("build.gradle"), "Gradle"),
    (Matcher::Name("build.gradle.kts"), "Gradle"),
    (Matcher::Name("Makefile"), "Make"),
];

/// (tool, Windows, Mac, Ubuntu)
const INSTALL_GUIDES: &[(&str, &str, &str, &str)] = &[
    (
        "Python",
        "Download and install from https://www.python.org/downloads/",
        "Use Homebrew: `brew install python3`",
        "Use apt: `sudo apt-get update && sudo apt-get install python3`",
    ),
    (
        "Terraform",
        "Download from https://developer.hashicorp.com/terraform/downloads",
        "Use Homebrew: `brew tap hashicorp/tap && brew install hashicorp/tap/terraform`",
        "Use apt: `sudo apt-get update && sudo apt-get install terraform` (or download a .zip from HashiCorp)",
    ),
    (
        "Bash/Shell",
        "Use Git Bash or WSL (Windows Subsystem for Linux)",
        "Pre-installed by default (bash/zsh)",
        "Pre-installed by default",
    ),
    (
        "Node.js / JavaScript",
        "Download from https://nodejs.org/en",
        "Use Homebrew: `brew install node`",
        "Use apt: `sudo apt-get update && sudo apt-get install nodejs npm`",
    ),
    (
        "TypeScript",
        "Install Node.js from https://nodejs.org/, then `npm install -g typescript`",
        "Install Node.js via Homebrew, then `npm install -g typescript`",
        "Install Node.js via apt, then `npm install -g typescript`",
    ),
    (
        "Docker",
        "Install Docker Desktop for Windows: https://www.docker.com/products/docker-desktop/",
        "Install Docker Desktop for Mac: https://www.docker.com/products/docker-desktop/",
        "Follow https://docs.docker.com/engine/install/ubuntu/",
    ),
    (
        "Rust",
        "Download and run `rustup-init.exe` from https://rustup.rs/",
        "Run `curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh`",
        "Run `curl --proto '=https' --tlsv1.2 -sSf https://sh.rustup.rs | sh`",
    ),
    (
        "Go",
        "Download the MSI installer from https://go.dev/dl/",
        "Use Homebrew: `brew install go`",
        "Use apt: `sudo apt-get update && sudo apt-get install golang-go`",
    ),
    (
        "Ruby",
        "Use RubyInstaller from https://rubyinstaller.org/",
        "Use Homebrew: `brew install ruby`",
        "Use apt: `sudo apt-get update && sudo apt-get install ruby-full`",
    ),
    (
        "Maven",
        "Download from https://maven.apache.org/download.cgi and add `bin` to PATH",
        "Use Homebrew: `brew install maven`",
        "Use apt: `sudo apt-get update && sudo apt-get install maven`",
    ),
    (
        "Gradle",
        "Download from https://gradle.org/install/ or use the project's `gradlew.bat`",
        "Use Homebrew: `brew install gradle`",
        "Use SDKMAN: `sdk install gradle` (or the project's `./gradlew`)",
    ),
    (
        "Make",
        "Install via Chocolatey: `choco install make` (or use WSL)",
        "Install Xcode Command Line Tools: `xcode-select --install`",
        "Use apt: `sudo apt-get update && sudo apt-get install build-essential`",
    ),
];

/// Extensions of build/infra artifacts worth asking the oracle about.
const INFRA_EXTENSIONS: &[&str] = &[
    ".hcl", ".nix", ".cmake", ".bazel", ".bzl", ".proto", ".gradle", ".sbt", ".cabal", ".nomad",
];

/// File names of build/infra artifacts worth asking the oracle about.
const INFRA_FILE_NAMES: &[&str] = &[
    "Jenkinsfile",
    "Vagrantfile",
    "Procfile",
    "Brewfile",
    "justfile",
    "Justfile",
    "Earthfile",
    "Tiltfile",
    "Podfile",
    "CMakeLists.txt",
    "WORKSPACE",
    "BUILD.bazel",
    "meson.build",
    "flake.nix",
    "Chart.yaml",
    "skaffold.yaml",
];

/// Outcome of the static pass over the tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticDetection {
    pub known: BTreeMap<String, ToolEntry>,
    /// Distinct unknown infra-like signatures, deduplicated.
    pub unknown: BTreeSet<String>,
}

/// Match every path against the signature table. No oracle calls.
pub fn detect_static<'a>(paths: impl IntoIterator<Item = &'a str>) -> StaticDetection {
    let mut detection = StaticDetection::default();
    for path in paths {
        let name = path.rsplit('/').next().unwrap_or(path);
        if let Some((matcher, tool)) = SIGNATURES.iter().find(|(m, _)| m.matches(name)) {
            detection
                .known
                .entry(tool.to_string())
                .or_insert_with(|| ToolEntry {
                    name: tool.to_string(),
                    basis: DetectionBasis::Signature(matcher.describe()),
                    install_instructions: guide_for(tool),
                });
        } else if let Some(signature) = infra_signature(name) {
            detection.unknown.insert(signature);
        }
    }
    detection
}

/// Full detection: static table, then one oracle call per unknown signature.
pub async fn detect_tools<'a>(
    paths: impl IntoIterator<Item = &'a str>,
    oracle: &OracleAdapter,
    temperature: f32,
) -> Result<BTreeMap<String, ToolEntry>, OracleError> {
    let StaticDetection { mut known, unknown } = detect_static(paths);

    let answers = try_join_all(
        unknown
            .iter()
            .map(|sig| oracle.detect_tool_usage(sig, temperature)),
    )
    .await?;

    for (signature, instructions) in unknown.into_iter().zip(answers) {
        tracing::debug!(%signature, "oracle-derived tool");
        known.entry(signature.clone()).or_insert(ToolEntry {
            name: signature.clone(),
            basis: DetectionBasis::Oracle(signature),
            install_instructions: instructions,
        });
    }
    Ok(known)
}

fn infra_signature(name: &str) -> Option<String> {
    if INFRA_FILE_NAMES.contains(&name) {
        return Some(name.to_string());
    }
    INFRA_EXTENSIONS
        .iter()
        .find(|ext| name.ends_with(*ext))
        .map(|ext| format!("*{}", ext))
}

fn guide_for(tool: &str) -> String {
    INSTALL_GUIDES
        .iter()
        .find(|(name, ..)| *name == tool)
        .map(|(_, windows, mac, ubuntu)| {
            format!(
                "**Windows**: {}\n**Mac**: {}\n**Ubuntu**: {}",
                windows, mac, ubuntu
            )
        })
        .unwrap_or_else(|| "**Windows**: N/A\n**Mac**: N/A\n**Ubuntu**: N/A".to_string())
}

/// Render the installation-steps section body.
pub fn render_install_section(tools: &BTreeMap<String, ToolEntry>) -> String {
    if tools.is_empty() {
        return "No tools detected.".to_string();
    }
    tools
        .values()
        .map(|t| format!("### {}\n\n{}\n", t.name, t.install_instructions.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}
