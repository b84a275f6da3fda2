//! Artifact placement into the target prefix.
//!
//! Install steps run in declared order, copying files (or whole directories)
//! from the staged source root into the prefix:
//!
//! ```text
//! <stage>/terraform-switcher-0.2.180/tfswitch  ──►  <prefix>/bin/tfswitch
//! ```
//!
//! Everything an invocation touches is journaled in an [`Installation`]:
//! placed files, directories it had to create, and the originals of replaced
//! files (moved aside into a backup directory under the prefix). A failed
//! step undoes the journal before the error is returned. A successful install
//! stays undoable until [`Installation::commit`], and dropping an uncommitted
//! journal rolls it back, so later pipeline failures and cancellation leave
//! the prefix exactly as it was.

use crate::manifest::InstallStep;
use crate::stage::StagedWorkspace;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("install source missing from staged sources: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("destination already exists: {} (use --replace to overwrite)", .0.display())]
    DestinationExists(PathBuf),

    #[error("permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("failed to install {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstallError {
    fn from_io(path: &Path, source: std::io::Error) -> Self {
        match source.kind() {
            ErrorKind::PermissionDenied => InstallError::PermissionDenied(path.to_path_buf()),
            _ => InstallError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Overwrite existing destinations instead of failing
    pub replace: bool,
}

/// Journal of one install invocation
#[derive(Debug)]
pub struct Installation {
    prefix: PathBuf,
    placed: Vec<PathBuf>,
    created_dirs: Vec<PathBuf>,
    backups: Vec<(PathBuf, PathBuf)>,
    backup_dir: Option<TempDir>,
    committed: bool,
}

impl Installation {
    fn new(prefix: &Path) -> Self {
        Self {
            prefix: prefix.to_path_buf(),
            placed: Vec::new(),
            created_dirs: Vec::new(),
            backups: Vec::new(),
            backup_dir: None,
            committed: false,
        }
    }

    /// Placed files, relative to the prefix, in placement order
    pub fn files(&self) -> Vec<PathBuf> {
        self.placed
            .iter()
            .filter_map(|p| p.strip_prefix(&self.prefix).ok())
            .map(Path::to_path_buf)
            .collect()
    }

    /// Keep everything that was placed and discard the backups
    pub fn commit(mut self) -> Vec<PathBuf> {
        self.committed = true;
        let files = self.files();
        // dropping the TempDir deletes replaced originals
        self.backup_dir.take();
        files
    }

    /// Remove everything placed by this invocation
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;

        for path in self.placed.drain(..).rev() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Rolled back {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to roll back {}: {}", path.display(), e),
            }
        }

        for (original, backup) in self.backups.drain(..).rev() {
            if let Err(e) = fs::rename(&backup, &original) {
                warn!("Failed to restore {}: {}", original.display(), e);
            }
        }

        // only ever removes directories this invocation created, and only if empty
        for dir in self.created_dirs.drain(..).rev() {
            let _ = fs::remove_dir(&dir);
        }

        self.backup_dir.take();
    }

    fn ensure_dir(&mut self, dir: &Path) -> Result<(), InstallError> {
        let missing: Vec<&Path> = dir.ancestors().take_while(|a| !a.exists()).collect();
        for created in missing.into_iter().rev() {
            fs::create_dir(created).map_err(|e| InstallError::from_io(created, e))?;
            self.created_dirs.push(created.to_path_buf());
        }
        Ok(())
    }

    /// Move an existing destination out of the way so rollback can restore it
    fn back_up(&mut self, dest: &Path) -> Result<(), InstallError> {
        let backup_root = match &self.backup_dir {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(".keg-backup-")
                    .tempdir_in(&self.prefix)
                    .map_err(|e| InstallError::from_io(&self.prefix, e))?;
                let root = dir.path().to_path_buf();
                self.backup_dir = Some(dir);
                root
            }
        };

        let backup = backup_root.join(self.backups.len().to_string());
        fs::rename(dest, &backup).map_err(|e| InstallError::from_io(dest, e))?;
        self.backups.push((dest.to_path_buf(), backup));
        Ok(())
    }

    fn place_file(
        &mut self,
        src: &Path,
        dest: &Path,
        options: &InstallOptions,
    ) -> Result<(), InstallError> {
        if dest.symlink_metadata().is_ok() {
            if !options.replace {
                return Err(InstallError::DestinationExists(dest.to_path_buf()));
            }
            self.back_up(dest)?;
        }

        if let Some(parent) = dest.parent() {
            self.ensure_dir(parent)?;
        }

        let file_type = src
            .symlink_metadata()
            .map_err(|e| InstallError::from_io(src, e))?
            .file_type();

        if file_type.is_symlink() {
            let target = fs::read_link(src).map_err(|e| InstallError::from_io(src, e))?;
            std::os::unix::fs::symlink(&target, dest).map_err(|e| InstallError::from_io(dest, e))?;
        } else {
            // fs::copy carries the permission bits, so executables stay executable
            fs::copy(src, dest).map_err(|e| InstallError::from_io(dest, e))?;
        }

        self.placed.push(dest.to_path_buf());
        Ok(())
    }

    fn place_tree(
        &mut self,
        src: &Path,
        dest: &Path,
        options: &InstallOptions,
    ) -> Result<(), InstallError> {
        self.ensure_dir(dest)?;

        for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(src).to_path_buf();
                InstallError::from_io(&path, e.into())
            })?;
            let rel = entry
                .path()
                .strip_prefix(src)
                .map_err(|_| InstallError::SourceMissing(entry.path().to_path_buf()))?;
            let target = dest.join(rel);

            if entry.file_type().is_dir() {
                self.ensure_dir(&target)?;
            } else {
                self.place_file(entry.path(), &target, options)?;
            }
        }
        Ok(())
    }
}

impl Drop for Installation {
    fn drop(&mut self) {
        if !self.committed {
            self.undo();
        }
    }
}

/// Run install steps against a staged workspace
pub fn install(
    workspace: &StagedWorkspace,
    steps: &[InstallStep],
    prefix: &Path,
    options: &InstallOptions,
) -> Result<Installation, InstallError> {
    install_from(workspace.source_root(), steps, prefix, options)
}

/// Run install steps from any source directory.
///
/// On error, the journal is dropped and everything placed so far is removed.
pub fn install_from(
    source_root: &Path,
    steps: &[InstallStep],
    prefix: &Path,
    options: &InstallOptions,
) -> Result<Installation, InstallError> {
    let mut installation = Installation::new(prefix);
    installation.ensure_dir(prefix)?;

    for step in steps {
        let src = source_root.join(&step.from);
        let dest = prefix.join(&step.to);

        let meta = src
            .symlink_metadata()
            .map_err(|_| InstallError::SourceMissing(step.from.clone()))?;

        debug!("Installing {} -> {}", step.from.display(), dest.display());
        if meta.is_dir() {
            installation.place_tree(&src, &dest, options)?;
        } else {
            installation.place_file(&src, &dest, options)?;
        }
    }

    Ok(installation)
}

/// Remove previously installed files and prune directories they leave empty
pub fn remove_artifacts(prefix: &Path, files: &[PathBuf]) -> Result<Vec<PathBuf>, InstallError> {
    let mut removed = Vec::new();

    for rel in files {
        let path = prefix.join(rel);
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path.clone()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Already gone: {}", path.display());
            }
            Err(e) => return Err(InstallError::from_io(&path, e)),
        }

        for dir in path.ancestors().skip(1) {
            if dir == prefix || !dir.starts_with(prefix) {
                break;
            }
            // stops at the first non-empty directory
            if fs::remove_dir(dir).is_err() {
                break;
            }
        }
    }

    Ok(removed)
}
