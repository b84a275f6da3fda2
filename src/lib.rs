//! Library interface for the kegstand (keg) package installer
//!
//! A package is described by a TOML manifest. Installing it runs a
//! resolve, fetch, verify, install, test, commit pipeline against a local
//! prefix and a persisted registry of installed packages.

pub mod config;
pub mod error;
pub mod fetch;
pub mod installer;
pub mod integrity;
pub mod manifest;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod stage;
pub mod test_runner;
pub mod version;

// Re-export commonly used types
pub use config::Config;
pub use error::{KegError, Result};
pub use fetch::{HttpTransport, Transport};
pub use manifest::{PackageManifest, SourceMode};
pub use pipeline::{
    DependencyPolicy, InstallReport, InstallRequest, Pipeline, PipelineFailure, PipelineOptions,
    Stage,
};
pub use registry::{InstalledPackage, InstalledPackageSet, Registry};
pub use version::Version;
