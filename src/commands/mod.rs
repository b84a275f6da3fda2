//! Command implementations for the keg CLI
//!
//! - **install**: run install requests through the pipeline
//! - **uninstall**: remove installed packages
//! - **list**: installed packages from the registry
//! - **info**: manifest details and install status
//! - **config**: resolved settings

pub mod config;
pub mod info;
pub mod install;
pub mod list;
pub mod uninstall;

use kegstand::error::Result;
use kegstand::manifest::{self, PackageManifest};
use kegstand::{Config, Registry};
use std::sync::Arc;
use tracing::debug;

/// Load a manifest by package name (from the formula dir) or by path
pub(crate) fn load_manifest(config: &Config, name_or_path: &str) -> Result<PackageManifest> {
    let path = config.manifest_path(name_or_path);
    debug!("Reading manifest {}", path.display());
    Ok(manifest::parse_file(&path)?)
}

pub(crate) fn open_registry(config: &Config) -> Result<Arc<Registry>> {
    let registry = Registry::open(&config.registry)?
        .with_lock_wait(config.lock_wait_attempts, config.lock_wait_interval);
    Ok(Arc::new(registry))
}
