//! Staging fetched archives into a disposable workspace.
//!
//! ```text
//! bytes (tar.gz | tar | zip) ──unpack──►  /tmp/.keg-stage-XXXXXX/
//!                                       terraform-switcher-0.2.180/   ← source root
//!                                         tfswitch
//!                                         main.go
//! ```
//!
//! The workspace is a [`tempfile::TempDir`]; dropping the handle removes the
//! directory, so every exit path of the pipeline cleans up after itself.

use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("unsupported archive format ({0})")]
    UnsupportedFormat(&'static str),

    #[error("failed to create staging directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

/// Sniff the archive format from its magic bytes
pub fn detect_format(bytes: &[u8]) -> Result<ArchiveFormat, StageError> {
    const USTAR_OFFSET: usize = 257;

    if bytes.starts_with(&[0x1f, 0x8b]) {
        return Ok(ArchiveFormat::TarGz);
    }
    if bytes.len() > USTAR_OFFSET + 5 && &bytes[USTAR_OFFSET..USTAR_OFFSET + 5] == b"ustar" {
        return Ok(ArchiveFormat::Tar);
    }
    if bytes.starts_with(b"PK\x03\x04") || bytes.starts_with(b"PK\x05\x06") {
        return Ok(ArchiveFormat::Zip);
    }
    if bytes.is_empty() {
        return Err(StageError::CorruptArchive("empty archive".to_string()));
    }
    Err(StageError::UnsupportedFormat("unrecognised"))
}

/// Unpacked sources for one install request
#[derive(Debug)]
pub struct StagedWorkspace {
    dir: TempDir,
    root: PathBuf,
}

impl StagedWorkspace {
    /// Directory install steps are resolved against
    pub fn source_root(&self) -> &Path {
        &self.root
    }

    /// The temporary directory itself
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Unpack an archive into a fresh, uniquely named temporary directory
pub fn stage(bytes: &[u8]) -> Result<StagedWorkspace, StageError> {
    stage_in(bytes, &std::env::temp_dir())
}

/// As [`stage`], under a specific parent directory
pub fn stage_in(bytes: &[u8], parent: &Path) -> Result<StagedWorkspace, StageError> {
    let format = detect_format(bytes)?;

    fs::create_dir_all(parent)?;
    let dir = tempfile::Builder::new()
        .prefix(".keg-stage-")
        .tempdir_in(parent)?;

    match format {
        ArchiveFormat::TarGz => unpack(GzDecoder::new(Cursor::new(bytes)), dir.path())?,
        ArchiveFormat::Tar => unpack(Cursor::new(bytes), dir.path())?,
        ArchiveFormat::Zip => unpack_zip(bytes, dir.path())?,
    }

    let root = find_source_root(dir.path())?;
    debug!("Staged sources at {}", root.display());
    Ok(StagedWorkspace { dir, root })
}

fn unpack<R: Read>(reader: R, dest: &Path) -> Result<(), StageError> {
    let mut archive = Archive::new(reader);
    archive.set_preserve_permissions(true);
    // tar's unpack refuses entries that would land outside `dest`
    archive
        .unpack(dest)
        .map_err(|e| StageError::CorruptArchive(e.to_string()))
}

/// `extract` restores recorded unix modes and rejects entries that would
/// land outside `dest`
fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<(), StageError> {
    let corrupt = |e: zip::result::ZipError| StageError::CorruptArchive(e.to_string());
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(corrupt)?;
    archive.extract(dest).map_err(corrupt)
}

/// GitHub-style archives wrap everything in one top-level directory;
/// step paths are relative to that directory when it is alone.
fn find_source_root(dir: &Path) -> Result<PathBuf, StageError> {
    let entries: Vec<_> = fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    match entries.as_slice() {
        [] => Err(StageError::CorruptArchive("archive has no entries".to_string())),
        [only] if only.file_type().map(|t| t.is_dir()).unwrap_or(false) => Ok(only.path()),
        _ => Ok(dir.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_stage_tar_gz_with_single_root() {
        let bytes = gzip(&tar_bytes(&[
            ("terraform-switcher-0.2.180/tfswitch", b"#!/bin/sh\n"),
            ("terraform-switcher-0.2.180/README.md", b"readme"),
        ]));
        let ws = stage(&bytes).unwrap();
        assert!(ws.source_root().ends_with("terraform-switcher-0.2.180"));
        assert!(ws.source_root().join("tfswitch").is_file());
    }

    #[test]
    fn test_stage_plain_tar_with_flat_layout() {
        let bytes = tar_bytes(&[("tfswitch", b"bin"), ("LICENSE", b"mit")]);
        assert_eq!(detect_format(&bytes).unwrap(), ArchiveFormat::Tar);
        let ws = stage(&bytes).unwrap();
        assert_eq!(ws.source_root(), ws.path());
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let bytes = gzip(&tar_bytes(&[("a/b", b"x")]));
        let path = {
            let ws = stage(&bytes).unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    fn zip_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        use std::io::Write;
        use zip::write::SimpleFileOptions;

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (path, data, mode) in entries {
            writer
                .start_file(*path, SimpleFileOptions::default().unix_permissions(*mode))
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_stage_zip_with_single_root() {
        use std::os::unix::fs::PermissionsExt;

        let bytes = zip_bytes(&[
            ("tfswitch_0.2.180/tfswitch", b"#!/bin/sh\necho 0.2.180\n", 0o755),
            ("tfswitch_0.2.180/LICENSE", b"mit", 0o644),
        ]);
        assert_eq!(detect_format(&bytes).unwrap(), ArchiveFormat::Zip);

        let ws = stage(&bytes).unwrap();
        assert!(ws.source_root().ends_with("tfswitch_0.2.180"));
        let binary = ws.source_root().join("tfswitch");
        assert_eq!(fs::read(&binary).unwrap(), b"#!/bin/sh\necho 0.2.180\n");
        assert_eq!(fs::metadata(&binary).unwrap().permissions().mode() & 0o777, 0o755);
    }

    #[test]
    fn test_unsupported_and_corrupt() {
        // zip magic with no central directory
        assert!(matches!(
            stage(b"PK\x03\x04rest-of-zip"),
            Err(StageError::CorruptArchive(_))
        ));
        assert!(matches!(
            stage(b"plain text, not an archive"),
            Err(StageError::UnsupportedFormat(_))
        ));
        assert!(matches!(stage(b""), Err(StageError::CorruptArchive(_))));

        // gzip magic followed by garbage
        let mut truncated = gzip(&tar_bytes(&[("a/b", b"x")]));
        truncated.truncate(12);
        assert!(matches!(stage(&truncated), Err(StageError::CorruptArchive(_))));
    }

    #[test]
    fn test_failed_stage_leaves_nothing_behind() {
        let parent = tempfile::TempDir::new().unwrap();
        let mut truncated = gzip(&tar_bytes(&[("a/b", b"x")]));
        truncated.truncate(12);
        assert!(stage_in(&truncated, parent.path()).is_err());
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }
}
