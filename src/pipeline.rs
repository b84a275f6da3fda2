//! Install pipeline orchestration.
//!
//! One install request runs as a linear state machine:
//!
//! ```text
//! Resolving ─► Fetching ─► Verifying ─► Installing ─► Testing ─► Committed
//!     │            │           │            │            │
//!     └────────────┴───────────┴────────────┴────────────┴──► Failed(reason)
//! ```
//!
//! - **Resolving**: select the locator, check conflicts and dependencies
//!   against a registry snapshot.
//! - **Fetching**: download the archive, with bounded retries. No lock held.
//! - **Verifying**: check the SHA-256 (release mode only), then unpack into a
//!   temporary workspace. Nothing unverified is ever written to disk.
//! - **Installing**: enter the registry's single-writer region, re-resolve
//!   against the fresh state, place artifacts.
//! - **Testing**: run the smoke test against the prefix.
//! - **Committed**: record the package and persist the registry.
//!
//! A failure at any stage leaves the registry untouched. The staging
//! workspace and the install journal are RAII values, so returning early,
//! cancelling, or hitting the deadline all release them the same way.

use crate::error::KegError;
use crate::fetch::{self, Transport};
use crate::installer::{self, InstallOptions};
use crate::integrity;
use crate::manifest::{PackageManifest, Source, SourceMode};
use crate::registry::{InstalledPackage, InstalledPackageSet, Registry};
use crate::resolver::{self, ResolutionError, ResolutionPlan};
use crate::stage;
use crate::test_runner::{self, TestResult};
use crate::version::Version;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pipeline states. `Failed` is carried by [`PipelineFailure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Stage {
    Resolving,
    Fetching,
    Verifying,
    Installing,
    Testing,
    Committed,
}

impl Stage {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Stage::Resolving,
            1 => Stage::Fetching,
            2 => Stage::Verifying,
            3 => Stage::Installing,
            4 => Stage::Testing,
            _ => Stage::Committed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Resolving => "resolution",
            Stage::Fetching => "fetch",
            Stage::Verifying => "verification",
            Stage::Installing => "install",
            Stage::Testing => "test",
            Stage::Committed => "commit",
        };
        f.write_str(name)
    }
}

/// What to do when declared dependencies are not installed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyPolicy {
    /// Log and report them, then carry on
    #[default]
    Report,
    /// Fail at resolution
    Require,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Overwrite existing files in the prefix
    pub replace: bool,
    /// A failing smoke test aborts and rolls back the install
    pub fail_test_is_fatal: bool,
    /// Extra attempts for transient fetch failures
    pub fetch_retries: u32,
    pub retry_backoff: Duration,
    /// Upper bound for a whole request
    pub deadline: Option<Duration>,
    pub dependency_policy: DependencyPolicy,
    /// Parent of staging workspaces; the system temp dir when unset
    pub staging_dir: Option<PathBuf>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            replace: false,
            fail_test_is_fatal: true,
            fetch_retries: 0,
            retry_backoff: Duration::from_secs(1),
            deadline: None,
            dependency_policy: DependencyPolicy::Report,
            staging_dir: None,
        }
    }
}

/// One package to install
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub manifest: PackageManifest,
    pub mode: SourceMode,
    /// Installed to satisfy another package rather than on request
    pub as_dependency: bool,
}

impl InstallRequest {
    pub fn new(manifest: PackageManifest) -> Self {
        Self {
            manifest,
            mode: SourceMode::Release,
            as_dependency: false,
        }
    }

    pub fn head(mut self, head: bool) -> Self {
        self.mode = if head {
            SourceMode::Head
        } else {
            SourceMode::Release
        };
        self
    }
}

/// Result of a committed install
#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub name: String,
    pub version: Version,
    pub source: SourceMode,
    pub plan: ResolutionPlan,
    pub test: TestResult,
    /// Placed files, relative to the prefix
    pub files: Vec<PathBuf>,
    /// Time taken (milliseconds)
    pub time_ms: u64,
}

/// Result of an uninstall
#[derive(Debug, Clone, Serialize)]
pub struct UninstallReport {
    pub name: String,
    pub version: Version,
    pub removed_files: usize,
    pub time_ms: u64,
}

/// The `Failed` state: where the pipeline stopped and why
#[derive(Debug, Error)]
#[error("{package}: {stage} failed: {error}")]
pub struct PipelineFailure {
    pub package: String,
    pub stage: Stage,
    #[source]
    pub error: KegError,
}

impl PipelineFailure {
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

/// Current stage, readable after the request future has been dropped
struct StageCell(AtomicU8);

impl StageCell {
    fn new() -> Self {
        Self(AtomicU8::new(Stage::Resolving as u8))
    }

    fn enter(&self, stage: Stage, package: &str) {
        self.0.store(stage as u8, Ordering::SeqCst);
        info!("{}: {:?}", package, stage);
    }

    fn get(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::SeqCst))
    }
}

/// Runs install and uninstall requests against one prefix and registry
pub struct Pipeline<T> {
    transport: T,
    registry: Arc<Registry>,
    prefix: PathBuf,
    options: PipelineOptions,
}

impl<T: Transport> Pipeline<T> {
    pub fn new(
        transport: T,
        registry: Arc<Registry>,
        prefix: impl Into<PathBuf>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            transport,
            registry,
            prefix: prefix.into(),
            options,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    /// Run one install request to `Committed` or `Failed`
    pub async fn install(
        &self,
        request: InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<InstallReport, PipelineFailure> {
        let stage = StageCell::new();
        let package = request.manifest.name().to_string();

        let outcome = match self.options.deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.run(&request, cancel, &stage)).await {
                    Ok(outcome) => outcome,
                    // the run future is dropped here, releasing workspace and journal
                    Err(_) => Err(PipelineFailure {
                        package: package.clone(),
                        stage: stage.get(),
                        error: KegError::DeadlineExceeded {
                            package: package.clone(),
                            deadline,
                        },
                    }),
                }
            }
            None => self.run(&request, cancel, &stage).await,
        };

        if let Err(failure) = &outcome {
            warn!("{}", failure);
        }
        outcome
    }

    async fn run(
        &self,
        request: &InstallRequest,
        cancel: &CancellationToken,
        stage: &StageCell,
    ) -> Result<InstallReport, PipelineFailure> {
        let start = Instant::now();
        let manifest = &request.manifest;
        let name = manifest.name();
        let fail = |at: Stage, error: KegError| PipelineFailure {
            package: name.to_string(),
            stage: at,
            error,
        };
        let checkpoint = |at: Stage| {
            if cancel.is_cancelled() {
                Err(fail(at, KegError::Cancelled(name.to_string())))
            } else {
                stage.enter(at, name);
                Ok(())
            }
        };

        // Resolving
        checkpoint(Stage::Resolving)?;
        let source = manifest
            .source(request.mode)
            .map_err(|e| fail(Stage::Resolving, e.into()))?;
        let snapshot = self.registry.snapshot().await;
        let plan = self
            .check_plan(manifest, &snapshot)
            .map_err(|e| fail(Stage::Resolving, e))?;
        if !plan.is_complete() {
            warn!(
                "{}: dependencies not installed: {}",
                name,
                plan.to_install_first.join(", ")
            );
        }

        // Fetching
        checkpoint(Stage::Fetching)?;
        let url = fetch::source_url(&source);
        debug!("{}: fetching {}", name, url);
        let bytes = cancellable(
            cancel,
            name,
            fetch::fetch_with_retry(
                &self.transport,
                &url,
                self.options.fetch_retries,
                self.options.retry_backoff,
            ),
        )
        .await
        .and_then(|r| r.map_err(KegError::from))
        .map_err(|e| fail(Stage::Fetching, e))?;

        // Verifying
        checkpoint(Stage::Verifying)?;
        match &source {
            Source::Release { checksum, .. } => integrity::verify(&bytes, checksum)
                .map_err(|e| fail(Stage::Verifying, e.into()))?,
            Source::Head { url } => warn!(
                "{}: installing from head {} without checksum verification",
                name, url
            ),
        }
        let staged = match &self.options.staging_dir {
            Some(dir) => stage::stage_in(&bytes, dir),
            None => stage::stage(&bytes),
        };
        let workspace = staged.map_err(|e| fail(Stage::Verifying, e.into()))?;
        drop(bytes);

        // Installing, inside the single-writer region through commit
        checkpoint(Stage::Installing)?;
        let mut guard = cancellable(cancel, name, self.registry.lock())
            .await
            .and_then(|r| r.map_err(KegError::from))
            .map_err(|e| fail(Stage::Installing, e))?;

        // another request may have committed since the snapshot
        let plan = self
            .check_plan(manifest, guard.packages())
            .map_err(|e| fail(Stage::Resolving, e))?;
        let previous = guard.packages().get(name).cloned();

        let installation = installer::install(
            &workspace,
            manifest.install_steps(),
            &self.prefix,
            &InstallOptions {
                replace: self.options.replace,
            },
        )
        .map_err(|e| fail(Stage::Installing, e.into()))?;

        // Testing
        checkpoint(Stage::Testing)?;
        let test = cancellable(
            cancel,
            name,
            test_runner::run_test(manifest.test_command(), &self.prefix),
        )
        .await
        .and_then(|r| r.map_err(KegError::from))
        .map_err(|e| fail(Stage::Testing, e))?;

        if let TestResult::Fail { exit_code, output } = &test {
            if self.options.fail_test_is_fatal {
                installation.rollback();
                return Err(fail(
                    Stage::Testing,
                    KegError::TestFailed {
                        package: name.to_string(),
                        exit_code: *exit_code,
                        output: output.clone(),
                    },
                ));
            }
            warn!("{}: smoke test failed with exit code {}, keeping install", name, exit_code);
        }

        // Committed
        checkpoint(Stage::Committed)?;
        let files = installation.files();
        let entry = InstalledPackage {
            name: name.to_string(),
            version: manifest.version().clone(),
            installed_as_dependency: request.as_dependency
                && previous.as_ref().is_none_or(|p| p.installed_as_dependency),
            source: source.mode(),
            files: files.clone(),
            dependencies: manifest.dependencies().to_vec(),
            installed_at: Utc::now(),
        };
        // on error the journal drops uncommitted and rolls back
        guard
            .commit(|set| {
                set.insert(entry);
            })
            .map_err(|e| fail(Stage::Committed, e.into()))?;
        installation.commit();

        // stale paths go while the writer lock is still held
        if let Some(previous) = previous {
            self.remove_stale_files(&previous, &files);
        }
        drop(guard);
        drop(workspace);

        info!("{}: committed {} ({} files)", name, manifest.version(), files.len());
        Ok(InstallReport {
            name: name.to_string(),
            version: manifest.version().clone(),
            source: source.mode(),
            plan,
            test,
            files,
            time_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn check_plan(
        &self,
        manifest: &PackageManifest,
        installed: &InstalledPackageSet,
    ) -> Result<ResolutionPlan, KegError> {
        let plan = resolver::resolve(manifest, installed)?;
        if self.options.dependency_policy == DependencyPolicy::Require {
            if let Some(missing) = plan.to_install_first.first() {
                return Err(ResolutionError::UnmetDependency {
                    package: manifest.name().to_string(),
                    dependency: missing.clone(),
                }
                .into());
            }
        }
        Ok(plan)
    }

    /// Files the previous version placed that the new one no longer does
    fn remove_stale_files(&self, previous: &InstalledPackage, current: &[PathBuf]) {
        let keep: HashSet<&PathBuf> = current.iter().collect();
        let stale: Vec<PathBuf> = previous
            .files
            .iter()
            .filter(|f| !keep.contains(f))
            .cloned()
            .collect();
        if stale.is_empty() {
            return;
        }
        match installer::remove_artifacts(&self.prefix, &stale) {
            Ok(removed) => debug!(
                "{}: removed {} files left by {}",
                previous.name,
                removed.len(),
                previous.version
            ),
            Err(e) => warn!("{}: failed to remove stale files: {}", previous.name, e),
        }
    }

    /// Remove an installed package and its recorded files
    pub async fn uninstall(&self, name: &str, force: bool) -> Result<UninstallReport, KegError> {
        let start = Instant::now();
        let mut guard = self.registry.lock().await?;

        let package = guard
            .packages()
            .get(name)
            .cloned()
            .ok_or_else(|| ResolutionError::NotInstalled(name.to_string()))?;

        if !force {
            let required_by: Vec<String> = guard
                .packages()
                .dependents_of(name)
                .into_iter()
                .map(|p| p.name.clone())
                .collect();
            if !required_by.is_empty() {
                return Err(ResolutionError::RequiredBy {
                    package: name.to_string(),
                    required_by,
                }
                .into());
            }
        }

        guard.commit(|set| {
            set.remove(name);
        })?;
        drop(guard);

        let removed = installer::remove_artifacts(&self.prefix, &package.files)?;
        info!("{}: uninstalled {} ({} files)", name, package.version, removed.len());

        Ok(UninstallReport {
            name: name.to_string(),
            version: package.version,
            removed_files: removed.len(),
            time_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// Race a stage future against cancellation
async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    package: &str,
    fut: F,
) -> Result<F::Output, KegError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(KegError::Cancelled(package.to_string())),
        output = fut => Ok(output),
    }
}
