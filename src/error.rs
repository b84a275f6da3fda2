use crate::fetch::FetchError;
use crate::installer::InstallError;
use crate::integrity::IntegrityError;
use crate::manifest::ManifestError;
use crate::registry::RegistryError;
use crate::resolver::ResolutionError;
use crate::stage::StageError;
use crate::test_runner::TestRunError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KegError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("smoke test failed for {package} (exit code {exit_code})")]
    TestFailed {
        package: String,
        exit_code: i32,
        output: String,
    },

    #[error(transparent)]
    TestRun(#[from] TestRunError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("install of {0} was cancelled")]
    Cancelled(String),

    #[error("install of {package} exceeded its {deadline:?} deadline")]
    DeadlineExceeded { package: String, deadline: Duration },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl KegError {
    /// Process exit code, one per error kind
    pub fn exit_code(&self) -> u8 {
        match self {
            KegError::Manifest(_) => 10,
            KegError::Integrity(_) => 11,
            KegError::Resolution(_) => 12,
            KegError::Fetch(_) | KegError::Http(_) => 13,
            KegError::Stage(_) => 14,
            KegError::Install(_) => 15,
            KegError::TestFailed { .. } | KegError::TestRun(_) => 16,
            KegError::Registry(_) => 17,
            KegError::Cancelled(_) => 18,
            KegError::DeadlineExceeded { .. } => 19,
            KegError::Json(_) | KegError::Io(_) | KegError::Other(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KegError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let errors = [
            KegError::Manifest(ManifestError::EmptyName),
            KegError::Integrity(IntegrityError::Mismatch {
                expected: "a".into(),
                actual: "b".into(),
            }),
            KegError::Resolution(ResolutionError::NotInstalled("x".into())),
            KegError::Fetch(FetchError::NotFound("u".into())),
            KegError::Stage(StageError::UnsupportedFormat("zip")),
            KegError::Install(InstallError::SourceMissing("p".into())),
            KegError::TestFailed {
                package: "x".into(),
                exit_code: 1,
                output: String::new(),
            },
            KegError::Registry(RegistryError::LockTimeout {
                path: "r".into(),
                attempts: 1,
            }),
            KegError::Cancelled("x".into()),
            KegError::DeadlineExceeded {
                package: "x".into(),
                deadline: Duration::from_secs(1),
            },
        ];

        let codes: HashSet<u8> = errors.iter().map(KegError::exit_code).collect();
        assert_eq!(codes.len(), errors.len());
        assert!(!codes.contains(&0));
    }
}
