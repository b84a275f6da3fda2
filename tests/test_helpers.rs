// Test helpers for isolated testing
// Provides throwaway prefixes, in-memory archives and a fake transport

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use kegstand::fetch::{FetchError, Transport};
use kegstand::integrity::sha256_hex;
use kegstand::manifest::{self, PackageManifest};
use kegstand::pipeline::{Pipeline, PipelineOptions};
use kegstand::registry::Registry;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use walkdir::WalkDir;

/// Isolated test environment using temporary directories
/// Automatically cleaned up when dropped (RAII pattern)
///
/// Layout:
/// - temp/
///   - prefix/                 (install target)
///   - state/registry.json     (installed package registry)
///   - Formula/                (manifests)
pub struct TestEnvironment {
    pub temp_dir: TempDir,
    pub prefix: PathBuf,
    pub registry: PathBuf,
    pub formula_dir: PathBuf,
}

impl TestEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let prefix = temp_dir.path().join("prefix");
        let registry = temp_dir.path().join("state").join("registry.json");
        let formula_dir = temp_dir.path().join("Formula");

        std::fs::create_dir_all(&prefix).unwrap();
        std::fs::create_dir_all(&formula_dir).unwrap();

        Self {
            temp_dir,
            prefix,
            registry,
            formula_dir,
        }
    }

    pub fn open_registry(&self) -> Arc<Registry> {
        Arc::new(
            Registry::open(&self.registry)
                .unwrap()
                .with_lock_wait(5, Duration::from_millis(20)),
        )
    }

    pub fn pipeline(
        &self,
        transport: MemoryTransport,
        options: PipelineOptions,
    ) -> Pipeline<MemoryTransport> {
        Pipeline::new(transport, self.open_registry(), &self.prefix, options)
    }

    /// Every file under the prefix with its contents
    pub fn prefix_snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        WalkDir::new(&self.prefix)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_type().is_dir())
            .map(|e| {
                let rel = e.path().strip_prefix(&self.prefix).unwrap().to_path_buf();
                (rel, std::fs::read(e.path()).unwrap())
            })
            .collect()
    }

    pub fn registry_bytes(&self) -> Option<Vec<u8>> {
        std::fs::read(&self.registry).ok()
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport serving canned bodies from memory
#[derive(Clone, Default)]
pub struct MemoryTransport {
    bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    requests: Arc<AtomicUsize>,
    transient_failures: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(self, url: &str, body: Vec<u8>) -> Self {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
        self
    }

    /// Fail this many requests with a transport error before serving
    pub fn failing_first(self, count: usize) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Wait this long before every response
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(FetchError::TransportFailure {
                url: url.to_string(),
                reason: "connection reset".to_string(),
            });
        }

        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(url.to_string()))
    }
}

/// Entries of a test archive
pub enum Entry<'a> {
    File(&'a str, &'a [u8]),
    Executable(&'a str, &'a str),
}

pub fn tar_gz(entries: &[Entry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::fast()));
    for entry in entries {
        let (path, data, mode) = match entry {
            Entry::File(path, data) => (*path, data.to_vec(), 0o644),
            Entry::Executable(path, script) => {
                (*path, format!("#!/bin/sh\n{}\n", script).into_bytes(), 0o755)
            }
        };
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder.append_data(&mut header, path, data.as_slice()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// A tfswitch release tarball whose binary runs `script`
pub fn tfswitch_archive(version: &str, script: &str) -> Vec<u8> {
    let dir = format!("terraform-switcher-{}", version);
    tar_gz(&[
        Entry::Executable(&format!("{}/tfswitch", dir), script),
        Entry::File(&format!("{}/README.md", dir), b"# terraform-switcher\n"),
    ])
}

pub const TFSWITCH_URL: &str =
    "https://github.com/warrensbox/terraform-switcher/archive/refs/tags/v0.2.180.tar.gz";
pub const TFSWITCH_HEAD: &str = "https://github.com/warrensbox/terraform-switcher.git";
pub const TFSWITCH_HEAD_ARCHIVE: &str =
    "https://github.com/warrensbox/terraform-switcher/archive/HEAD.tar.gz";

/// The tfswitch manifest for `url`/`version`, checksummed against `archive`
pub fn tfswitch_manifest_text(url: &str, version: &str, archive: &[u8]) -> String {
    format!(
        r#"
name = "tfswitch"
description = "Switch between different versions of terraform"
homepage = "https://tfswitch.warrensbox.com"
url = "{url}"
head = "{head}"
version = "{version}"
checksum = "{checksum}"
build_dependencies = ["make", "gcc"]
dependencies = ["git"]
conflicts = ["terraform"]
test_command = "bin/tfswitch --version"

[[install_steps]]
from = "tfswitch"
to = "bin/tfswitch"
"#,
        url = url,
        head = TFSWITCH_HEAD,
        version = version,
        checksum = sha256_hex(archive),
    )
}

pub fn tfswitch_manifest(archive: &[u8]) -> PackageManifest {
    manifest::parse(&tfswitch_manifest_text(TFSWITCH_URL, "0.2.180", archive)).unwrap()
}

/// Minimal manifest installing `bin/<name>` from a release archive
pub fn simple_manifest(
    name: &str,
    version: &str,
    url: &str,
    archive: &[u8],
    conflicts: &[&str],
) -> PackageManifest {
    let conflicts = conflicts
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");
    manifest::parse(&format!(
        r#"
name = "{name}"
url = "{url}"
version = "{version}"
checksum = "{checksum}"
conflicts = [{conflicts}]
test_command = "bin/{name} --version"

[[install_steps]]
from = "{name}"
to = "bin/{name}"
"#,
        checksum = sha256_hex(archive),
    ))
    .unwrap()
}

pub fn exists(root: &Path, rel: &str) -> bool {
    root.join(rel).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new();

        assert!(env.prefix.exists());
        assert!(env.formula_dir.exists());
        assert!(!env.registry.exists());
        assert!(env.prefix_snapshot().is_empty());
    }

    #[test]
    fn test_environment_cleanup() {
        let prefix = {
            let env = TestEnvironment::new();
            env.prefix.clone()
        };

        // After env is dropped, temp directory should be cleaned up
        assert!(!prefix.exists());
    }

    #[tokio::test]
    async fn test_memory_transport_failures_then_body() {
        let transport = MemoryTransport::new()
            .serve("u", b"body".to_vec())
            .failing_first(1);

        assert!(transport.get("u").await.unwrap_err().is_transient());
        assert_eq!(transport.get("u").await.unwrap(), b"body");
        assert!(matches!(transport.get("v").await, Err(FetchError::NotFound(_))));
        assert_eq!(transport.requests(), 3);
    }
}
