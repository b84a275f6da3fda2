//! Installed-package registry.
//!
//! The registry records every committed install as an [`InstalledPackage`]
//! in a single JSON file:
//!
//! ```text
//! <prefix>/var/keg/registry.json
//! <prefix>/var/keg/registry.json.lock   # advisory lock held while committing
//! ```
//!
//! It is the only record of what is installed, so it is written exactly once
//! per successful install or uninstall, through an atomic write-then-rename.
//!
//! Two layers keep concurrent installs from validating against a stale view:
//! an in-process [`tokio::sync::RwLock`] and an exclusive `fs2` file lock for
//! other processes. [`Registry::lock`] takes both and reloads the file before
//! handing out a [`RegistryGuard`].

use crate::manifest::SourceMode;
use crate::version::Version;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registry file {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out waiting for registry lock {} after {attempts} attempts", path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },
}

/// One committed installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Version,
    /// Installed to satisfy another package rather than on request
    #[serde(default)]
    pub installed_as_dependency: bool,
    #[serde(default)]
    pub source: SourceMode,
    /// Placed artifacts, relative to the prefix
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Runtime dependencies declared by the manifest
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub installed_at: DateTime<Utc>,
}

/// Name → installed package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackageSet {
    #[serde(default)]
    packages: BTreeMap<String, InstalledPackage>,
}

impl InstalledPackageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&InstalledPackage> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn insert(&mut self, package: InstalledPackage) -> Option<InstalledPackage> {
        self.packages.insert(package.name.clone(), package)
    }

    pub fn remove(&mut self, name: &str) -> Option<InstalledPackage> {
        self.packages.remove(name)
    }

    /// Installed packages in name order
    pub fn iter(&self) -> impl Iterator<Item = &InstalledPackage> {
        self.packages.values()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    /// Installed packages that declare `name` as a runtime dependency
    pub fn dependents_of(&self, name: &str) -> Vec<&InstalledPackage> {
        self.packages
            .values()
            .filter(|pkg| pkg.name != name && pkg.dependencies.iter().any(|d| d == name))
            .collect()
    }

    /// Load from disk; a missing file is an empty registry
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(source) => {
                return Err(RegistryError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&contents).map_err(|source| RegistryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Persist atomically: write a sibling temp file, then rename over the target
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(io_err)?;

        let json = serde_json::to_string_pretty(self).map_err(|source| RegistryError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(json.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;

        debug!("Saved registry with {} packages to {}", self.len(), path.display());
        Ok(())
    }
}

/// Shared, persisted registry
pub struct Registry {
    path: PathBuf,
    state: RwLock<InstalledPackageSet>,
    lock_wait_attempts: u32,
    lock_wait_interval: Duration,
}

impl Registry {
    /// Open the registry file, creating nothing until the first commit
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let state = InstalledPackageSet::load(&path)?;
        debug!("Loaded {} installed packages from {}", state.len(), path.display());
        Ok(Self {
            path,
            state: RwLock::new(state),
            lock_wait_attempts: 90,
            lock_wait_interval: Duration::from_secs(2),
        })
    }

    /// How long [`Registry::lock`] waits for another process
    pub fn with_lock_wait(mut self, attempts: u32, interval: Duration) -> Self {
        self.lock_wait_attempts = attempts.max(1);
        self.lock_wait_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Copy of the current state, for read-only checks
    pub async fn snapshot(&self) -> InstalledPackageSet {
        self.state.read().await.clone()
    }

    /// Take the single-writer region: in-process write lock, then the file lock.
    ///
    /// The state is reloaded from disk once both are held, so the guard always
    /// sees commits made by other processes.
    pub async fn lock(&self) -> Result<RegistryGuard<'_>, RegistryError> {
        let mut state = self.state.write().await;
        let file_lock = FileLock::acquire(
            &self.lock_path(),
            self.lock_wait_attempts,
            self.lock_wait_interval,
        )
        .await?;

        *state = InstalledPackageSet::load(&self.path)?;

        Ok(RegistryGuard {
            state,
            path: &self.path,
            _file_lock: file_lock,
        })
    }
}

/// Exclusive access to the registry until dropped
pub struct RegistryGuard<'a> {
    state: RwLockWriteGuard<'a, InstalledPackageSet>,
    path: &'a Path,
    _file_lock: FileLock,
}

impl RegistryGuard<'_> {
    pub fn packages(&self) -> &InstalledPackageSet {
        &self.state
    }

    /// Apply a mutation and persist it. Memory changes only if the write succeeds.
    pub fn commit<F>(&mut self, mutate: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut InstalledPackageSet),
    {
        let mut next = self.state.clone();
        mutate(&mut next);
        next.save(self.path)?;
        *self.state = next;
        Ok(())
    }
}

/// Advisory lock file shared with other processes
struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    async fn acquire(
        path: &Path,
        attempts: u32,
        interval: Duration,
    ) -> Result<Self, RegistryError> {
        let io_err = |source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        let contended = fs2::lock_contended_error().raw_os_error();
        for attempt in 1..=attempts {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!("Acquired registry lock {}", path.display());
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.raw_os_error() == contended => {
                    info!(
                        "Waiting for registry lock {} (attempt {} of {})",
                        path.display(),
                        attempt,
                        attempts
                    );
                    if attempt < attempts {
                        tokio::time::sleep(interval).await;
                    }
                }
                Err(source) => return Err(io_err(source)),
            }
        }

        Err(RegistryError::LockTimeout {
            path: path.to_path_buf(),
            attempts,
        })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release registry lock {}: {}", self.path.display(), e);
        } else {
            debug!("Released registry lock {}", self.path.display());
        }
    }
}
