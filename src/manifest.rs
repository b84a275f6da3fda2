//! Package manifests - the parse-and-validate boundary.
//!
//! A manifest is a small TOML document describing one installable package,
//! modelled on a Homebrew formula:
//!
//! ```toml
//! name = "tfswitch"
//! version = "0.2.180"
//! url = "https://github.com/warrensbox/terraform-switcher/archive/0.2.180.tar.gz"
//! head = "https://github.com/warrensbox/terraform-switcher.git"
//! checksum = "4e64...618"
//! build_dependencies = ["make", "gcc", "go"]
//! dependencies = ["git"]
//! conflicts = ["terraform"]
//! test_command = "bin/tfswitch --version"
//!
//! [[install_steps]]
//! from = "tfswitch"
//! to = "bin/tfswitch"
//! ```
//!
//! [`parse`] turns the loosely structured document into a [`PackageManifest`]
//! whose invariants hold for the rest of the pipeline. Nothing downstream
//! re-validates.

use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse manifest: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("manifest name must not be empty")]
    EmptyName,

    #[error("invalid package name '{0}'")]
    InvalidName(String),

    #[error("malformed version '{0}'")]
    MalformedVersion(String),

    #[error("{0}: manifest declares neither url nor head")]
    MissingSource(String),

    #[error("{0}: release url requires a {SHA256_HEX_LEN}-character sha256 checksum")]
    MissingChecksum(String),

    #[error("invalid install path '{}': must be relative and stay inside its root", .0.display())]
    InvalidInstallPath(PathBuf),

    #[error("{package}: invalid package name '{dependency}' in {list}")]
    InvalidDependencyName {
        package: String,
        dependency: String,
        list: &'static str,
    },

    #[error("{package}: '{dependency}' is declared more than once in {list}")]
    DuplicateDependency {
        package: String,
        dependency: String,
        list: &'static str,
    },

    #[error("{package}: '{other}' is declared as both a conflict and a requirement")]
    ConflictingDeclaration { package: String, other: String },

    #[error("{0}: no install steps declared")]
    NoInstallSteps(String),

    #[error("{0}: test command must not be empty")]
    EmptyTestCommand(String),

    #[error("{package}: cannot parse test command '{command}'")]
    InvalidTestCommand { package: String, command: String },

    #[error("{0}: no head url declared")]
    MissingHeadUrl(String),

    #[error("{0}: no release url declared")]
    MissingSourceUrl(String),
}

/// Which locator an install request uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Tagged release archive, checksum verified
    #[default]
    Release,
    /// Live repository snapshot, not verified
    Head,
}

impl std::fmt::Display for SourceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceMode::Release => f.write_str("release"),
            SourceMode::Head => f.write_str("head"),
        }
    }
}

/// The locator selected for one install request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Release { url: String, checksum: String },
    Head { url: String },
}

impl Source {
    pub fn url(&self) -> &str {
        match self {
            Source::Release { url, .. } | Source::Head { url } => url,
        }
    }

    pub fn mode(&self) -> SourceMode {
        match self {
            Source::Release { .. } => SourceMode::Release,
            Source::Head { .. } => SourceMode::Head,
        }
    }
}

/// One artifact placement: `from` inside the staged sources, `to` inside the prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallStep {
    pub from: PathBuf,
    pub to: PathBuf,
}

/// The document as written, before validation
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    homepage: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    head: Option<String>,
    version: String,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    build_dependencies: Vec<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    conflicts: Vec<String>,
    #[serde(default)]
    install_steps: Vec<InstallStep>,
    test_command: String,
}

/// A validated package definition. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct PackageManifest {
    name: String,
    description: Option<String>,
    homepage: Option<String>,
    version: Version,
    url: Option<String>,
    head: Option<String>,
    checksum: Option<String>,
    build_dependencies: Vec<String>,
    dependencies: Vec<String>,
    conflicts: Vec<String>,
    install_steps: Vec<InstallStep>,
    test_command: String,
}

/// Parse and validate manifest text
pub fn parse(raw_text: &str) -> Result<PackageManifest, ManifestError> {
    let raw: RawManifest = toml::from_str(raw_text)?;
    validate(raw)
}

/// Read and parse a manifest file
pub fn parse_file(path: &Path) -> Result<PackageManifest, ManifestError> {
    let contents = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&contents)
}

fn validate(raw: RawManifest) -> Result<PackageManifest, ManifestError> {
    let name = raw.name.trim().to_string();
    if name.is_empty() {
        return Err(ManifestError::EmptyName);
    }
    if !is_valid_name(&name) {
        return Err(ManifestError::InvalidName(name));
    }

    let version =
        Version::parse(&raw.version).map_err(|_| ManifestError::MalformedVersion(raw.version))?;

    let url = non_empty(raw.url);
    let head = non_empty(raw.head);
    if url.is_none() && head.is_none() {
        return Err(ManifestError::MissingSource(name));
    }

    // A release locator is only usable with a well-formed digest
    let checksum = match (&url, non_empty(raw.checksum)) {
        (Some(_), Some(sum)) if is_sha256_hex(&sum) => Some(sum.to_ascii_lowercase()),
        (Some(_), _) => return Err(ManifestError::MissingChecksum(name)),
        (None, sum) => sum.map(|s| s.to_ascii_lowercase()),
    };

    let build_dependencies = trimmed(raw.build_dependencies);
    let dependencies = trimmed(raw.dependencies);
    let conflicts = trimmed(raw.conflicts);
    for (list, entries) in [
        ("build_dependencies", &build_dependencies),
        ("dependencies", &dependencies),
        ("conflicts", &conflicts),
    ] {
        check_names(&name, list, entries)?;
        check_unique(&name, list, entries)?;
    }

    for conflict in &conflicts {
        if *conflict == name
            || build_dependencies.contains(conflict)
            || dependencies.contains(conflict)
        {
            return Err(ManifestError::ConflictingDeclaration {
                package: name,
                other: conflict.clone(),
            });
        }
    }

    if raw.install_steps.is_empty() {
        return Err(ManifestError::NoInstallSteps(name));
    }
    for step in &raw.install_steps {
        check_contained(&step.from)?;
        check_contained(&step.to)?;
    }

    let test_command = raw.test_command.trim().to_string();
    if test_command.is_empty() {
        return Err(ManifestError::EmptyTestCommand(name));
    }
    if shlex::split(&test_command).is_none() {
        return Err(ManifestError::InvalidTestCommand {
            package: name,
            command: test_command,
        });
    }

    Ok(PackageManifest {
        name,
        description: non_empty(raw.description),
        homepage: non_empty(raw.homepage),
        version,
        url,
        head,
        checksum,
        build_dependencies,
        dependencies,
        conflicts,
        install_steps: raw.install_steps,
        test_command,
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn is_valid_name(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '@' | '+' | '-'))
}

pub(crate) fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn trimmed(entries: Vec<String>) -> Vec<String> {
    entries.into_iter().map(|e| e.trim().to_string()).collect()
}

fn check_names(
    package: &str,
    list: &'static str,
    entries: &[String],
) -> Result<(), ManifestError> {
    match entries.iter().find(|e| e.is_empty() || !is_valid_name(e)) {
        Some(bad) => Err(ManifestError::InvalidDependencyName {
            package: package.to_string(),
            dependency: bad.clone(),
            list,
        }),
        None => Ok(()),
    }
}

fn check_unique(
    package: &str,
    list: &'static str,
    entries: &[String],
) -> Result<(), ManifestError> {
    let mut seen = HashSet::new();
    for entry in entries {
        if !seen.insert(entry.as_str()) {
            return Err(ManifestError::DuplicateDependency {
                package: package.to_string(),
                dependency: entry.clone(),
                list,
            });
        }
    }
    Ok(())
}

/// Reject absolute paths and any `..` so a step can never escape its root
fn check_contained(path: &Path) -> Result<(), ManifestError> {
    let mut normal = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ManifestError::InvalidInstallPath(path.to_path_buf()));
            }
        }
    }
    if normal == 0 {
        return Err(ManifestError::InvalidInstallPath(path.to_path_buf()));
    }
    Ok(())
}

impl PackageManifest {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn homepage(&self) -> Option<&str> {
        self.homepage.as_deref()
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    pub fn build_dependencies(&self) -> &[String] {
        &self.build_dependencies
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn conflicts(&self) -> &[String] {
        &self.conflicts
    }

    pub fn install_steps(&self) -> &[InstallStep] {
        &self.install_steps
    }

    pub fn test_command(&self) -> &str {
        &self.test_command
    }

    /// Select the locator for an install request
    pub fn source(&self, mode: SourceMode) -> Result<Source, ManifestError> {
        match mode {
            SourceMode::Release => {
                let url = self
                    .url
                    .clone()
                    .ok_or_else(|| ManifestError::MissingSourceUrl(self.name.clone()))?;
                // validate() guarantees a checksum whenever url is set
                let checksum = self
                    .checksum
                    .clone()
                    .ok_or_else(|| ManifestError::MissingChecksum(self.name.clone()))?;
                Ok(Source::Release { url, checksum })
            }
            SourceMode::Head => {
                let url = self
                    .head
                    .clone()
                    .ok_or_else(|| ManifestError::MissingHeadUrl(self.name.clone()))?;
                Ok(Source::Head { url })
            }
        }
    }
}
