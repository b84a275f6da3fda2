//! Single-level dependency and conflict resolution.
//!
//! Resolution answers two questions about a manifest against the current
//! registry, in this order:
//!
//! 1. Is anything it conflicts with installed? Conflicts always block,
//!    whatever the versions, and are checked before anything else.
//! 2. Which declared dependencies are missing? Build dependencies come first,
//!    then runtime dependencies, in declaration order without duplicates.
//!
//! Dependencies of dependencies are not followed. The plan reports what the
//! caller must satisfy; it performs no installs itself.

use crate::manifest::PackageManifest;
use crate::registry::InstalledPackageSet;
use crate::version::Version;
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("{package} conflicts with installed package {conflicts_with} {installed_version}")]
    Conflict {
        package: String,
        conflicts_with: String,
        installed_version: String,
    },

    #[error("{package} requires {dependency}, which is not installed")]
    UnmetDependency { package: String, dependency: String },

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("cannot uninstall {package}: required by {}", required_by.join(", "))]
    RequiredBy {
        package: String,
        required_by: Vec<String>,
    },
}

/// What installing this manifest does relative to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PlanAction {
    /// Not installed yet
    Fresh,
    /// Same version already installed
    Reinstall,
    Upgrade { from: Version },
    Downgrade { from: Version },
}

/// Read-only outcome of [`resolve`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionPlan {
    pub package: String,
    pub action: PlanAction,
    /// Missing dependencies, first-seen order, build dependencies first
    pub to_install_first: Vec<String>,
    /// Dependencies already present in the registry
    pub satisfied: Vec<String>,
}

impl ResolutionPlan {
    pub fn is_complete(&self) -> bool {
        self.to_install_first.is_empty()
    }
}

pub fn resolve(
    manifest: &PackageManifest,
    installed: &InstalledPackageSet,
) -> Result<ResolutionPlan, ResolutionError> {
    // Conflicts short-circuit before any dependency is looked at
    for conflict in manifest.conflicts() {
        if let Some(existing) = installed.get(conflict) {
            return Err(ResolutionError::Conflict {
                package: manifest.name().to_string(),
                conflicts_with: conflict.clone(),
                installed_version: existing.version.to_string(),
            });
        }
    }

    let mut seen = HashSet::new();
    let mut to_install_first = Vec::new();
    let mut satisfied = Vec::new();

    for dependency in manifest
        .build_dependencies()
        .iter()
        .chain(manifest.dependencies())
    {
        if !seen.insert(dependency.as_str()) {
            continue;
        }
        if installed.contains(dependency) {
            satisfied.push(dependency.clone());
        } else {
            to_install_first.push(dependency.clone());
        }
    }

    let action = match installed.get(manifest.name()) {
        None => PlanAction::Fresh,
        Some(existing) => match manifest.version().cmp(&existing.version) {
            std::cmp::Ordering::Equal => PlanAction::Reinstall,
            std::cmp::Ordering::Greater => PlanAction::Upgrade {
                from: existing.version.clone(),
            },
            std::cmp::Ordering::Less => PlanAction::Downgrade {
                from: existing.version.clone(),
            },
        },
    };

    Ok(ResolutionPlan {
        package: manifest.name().to_string(),
        action,
        to_install_first,
        satisfied,
    })
}
