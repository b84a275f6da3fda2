//! Runtime configuration.
//!
//! Settings resolve in increasing precedence:
//!
//! 1. built-in defaults
//! 2. an optional TOML file (`$KEG_CONFIG`, else `<prefix>/etc/keg.toml`)
//! 3. environment variables (`KEG_PREFIX`, `KEG_REGISTRY`, `KEG_FORMULA_DIR`,
//!    `KEG_FETCH_RETRIES`)
//! 4. command-line flags, applied by the caller on the returned [`Config`]
//!
//! ```toml
//! # <prefix>/etc/keg.toml
//! formula_dir = "/srv/formulae"
//! fetch_retries = 3
//! fail_test_is_fatal = true
//! dependency_policy = "require"
//! ```

use crate::pipeline::{DependencyPolicy, PipelineOptions};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub prefix: PathBuf,
    pub registry: PathBuf,
    pub formula_dir: PathBuf,
    /// File the settings were read from, if any
    pub config_file: Option<PathBuf>,
    pub pipeline: PipelineOptions,
    pub lock_wait_attempts: u32,
    pub lock_wait_interval: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    prefix: Option<PathBuf>,
    registry: Option<PathBuf>,
    formula_dir: Option<PathBuf>,
    replace: Option<bool>,
    fail_test_is_fatal: Option<bool>,
    fetch_retries: Option<u32>,
    retry_backoff_secs: Option<u64>,
    timeout_secs: Option<u64>,
    dependency_policy: Option<DependencyPolicy>,
    lock_wait_attempts: Option<u32>,
    lock_wait_interval_secs: Option<u64>,
    staging_dir: Option<PathBuf>,
}

/// Default prefix: `$HOME/.keg`
pub fn default_prefix() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".keg")
}

impl Config {
    /// Resolve from the process environment
    pub fn load() -> Result<Self> {
        Self::resolve(|key| std::env::var(key).ok())
    }

    /// Resolve using `env` for variable lookups
    pub fn resolve<F>(env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_prefix = env("KEG_PREFIX").map(PathBuf::from);
        let explicit_file = env("KEG_CONFIG").map(PathBuf::from);

        let candidate = explicit_file.clone().unwrap_or_else(|| {
            env_prefix
                .clone()
                .unwrap_or_else(default_prefix)
                .join("etc/keg.toml")
        });

        let (file, config_file) = if candidate.exists() {
            (read_file(&candidate)?, Some(candidate))
        } else if let Some(explicit) = explicit_file {
            anyhow::bail!("Config file not found: {}", explicit.display());
        } else {
            (ConfigFile::default(), None)
        };

        let prefix = env_prefix
            .or(file.prefix)
            .unwrap_or_else(default_prefix);

        let registry = env("KEG_REGISTRY")
            .map(PathBuf::from)
            .or(file.registry)
            .unwrap_or_else(|| prefix.join("var/keg/registry.json"));

        let formula_dir = env("KEG_FORMULA_DIR")
            .map(PathBuf::from)
            .or(file.formula_dir)
            .unwrap_or_else(|| prefix.join("Formula"));

        let defaults = PipelineOptions::default();
        let fetch_retries = match env("KEG_FETCH_RETRIES") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("KEG_FETCH_RETRIES must be a number, got '{}'", raw))?,
            None => file.fetch_retries.unwrap_or(defaults.fetch_retries),
        };

        let pipeline = PipelineOptions {
            replace: file.replace.unwrap_or(defaults.replace),
            fail_test_is_fatal: file.fail_test_is_fatal.unwrap_or(defaults.fail_test_is_fatal),
            fetch_retries,
            retry_backoff: file
                .retry_backoff_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retry_backoff),
            deadline: file.timeout_secs.map(Duration::from_secs).or(defaults.deadline),
            dependency_policy: file.dependency_policy.unwrap_or(defaults.dependency_policy),
            staging_dir: file.staging_dir.or(defaults.staging_dir),
        };

        Ok(Self {
            prefix,
            registry,
            formula_dir,
            config_file,
            pipeline,
            lock_wait_attempts: file.lock_wait_attempts.unwrap_or(90),
            lock_wait_interval: Duration::from_secs(file.lock_wait_interval_secs.unwrap_or(2)),
        })
    }

    /// Move to a different prefix; paths that derived from the old one follow it
    pub fn with_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        if self.registry == self.prefix.join("var/keg/registry.json") {
            self.registry = prefix.join("var/keg/registry.json");
        }
        if self.formula_dir == self.prefix.join("Formula") {
            self.formula_dir = prefix.join("Formula");
        }
        self.prefix = prefix;
        self
    }

    /// Manifest path for a package name, or the argument itself if it is a file
    pub fn manifest_path(&self, name_or_path: &str) -> PathBuf {
        let direct = Path::new(name_or_path);
        if direct.is_file() {
            return direct.to_path_buf();
        }
        self.formula_dir.join(format!("{}.toml", name_or_path))
    }
}

fn read_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_derive_from_prefix() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_path_buf();
        let config = Config::resolve(env_from(&[("KEG_PREFIX", prefix.display().to_string())]))
            .unwrap();

        assert_eq!(config.prefix, prefix);
        assert_eq!(config.registry, prefix.join("var/keg/registry.json"));
        assert_eq!(config.formula_dir, prefix.join("Formula"));
        assert!(config.config_file.is_none());
        assert!(!config.pipeline.replace);
        assert!(config.pipeline.fail_test_is_fatal);
        assert_eq!(config.pipeline.fetch_retries, 0);
    }

    #[test]
    fn test_file_then_env_precedence() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().to_path_buf();
        fs::create_dir_all(prefix.join("etc")).unwrap();
        fs::write(
            prefix.join("etc/keg.toml"),
            r#"
formula_dir = "/srv/formulae"
fetch_retries = 3
fail_test_is_fatal = false
dependency_policy = "require"
timeout_secs = 600
staging_dir = "/var/tmp/keg"
"#,
        )
        .unwrap();

        let config = Config::resolve(env_from(&[
            ("KEG_PREFIX", prefix.display().to_string()),
            ("KEG_FETCH_RETRIES", "5".to_string()),
        ]))
        .unwrap();

        assert_eq!(config.formula_dir, PathBuf::from("/srv/formulae"));
        assert_eq!(config.pipeline.fetch_retries, 5);
        assert!(!config.pipeline.fail_test_is_fatal);
        assert_eq!(config.pipeline.dependency_policy, DependencyPolicy::Require);
        assert_eq!(config.pipeline.deadline, Some(Duration::from_secs(600)));
        assert_eq!(config.pipeline.staging_dir, Some(PathBuf::from("/var/tmp/keg")));
        assert_eq!(config.config_file, Some(prefix.join("etc/keg.toml")));
    }

    #[test]
    fn test_bad_values_are_errors() {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().display().to_string();
        assert!(
            Config::resolve(env_from(&[
                ("KEG_PREFIX", prefix.clone()),
                ("KEG_FETCH_RETRIES", "lots".to_string()),
            ]))
            .is_err()
        );
        assert!(
            Config::resolve(env_from(&[
                ("KEG_PREFIX", prefix),
                ("KEG_CONFIG", "/nonexistent/keg.toml".to_string()),
            ]))
            .is_err()
        );
    }

    #[test]
    fn test_with_prefix_moves_derived_paths() {
        let dir = TempDir::new().unwrap();
        let config = Config::resolve(env_from(&[
            ("KEG_PREFIX", dir.path().display().to_string()),
            ("KEG_REGISTRY", "/var/lib/keg/registry.json".to_string()),
        ]))
        .unwrap()
        .with_prefix("/opt/keg");

        assert_eq!(config.prefix, PathBuf::from("/opt/keg"));
        assert_eq!(config.formula_dir, PathBuf::from("/opt/keg/Formula"));
        assert_eq!(config.registry, PathBuf::from("/var/lib/keg/registry.json"));
    }

    #[test]
    fn test_manifest_path_lookup() {
        let dir = TempDir::new().unwrap();
        let config = Config::resolve(env_from(&[(
            "KEG_PREFIX",
            dir.path().display().to_string(),
        )]))
        .unwrap();

        assert_eq!(
            config.manifest_path("tfswitch"),
            dir.path().join("Formula/tfswitch.toml")
        );

        let local = dir.path().join("local.toml");
        fs::write(&local, "").unwrap();
        assert_eq!(config.manifest_path(local.to_str().unwrap()), local);
    }
}
