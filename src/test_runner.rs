//! Post-install smoke tests.
//!
//! A manifest declares one command, e.g. `bin/tfswitch --version`. It runs as
//! an external process with `<prefix>/bin` first on `PATH`; a first word with
//! a `/` in it is resolved against the prefix. A non-zero exit is a
//! reportable [`TestResult::Fail`], never an error.

use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tracing::debug;

/// Exit code reported when the command cannot be started at all
pub const EXIT_NOT_RUNNABLE: i32 = 127;
/// Exit code reported when the command was killed by a signal
pub const EXIT_SIGNALLED: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum TestResult {
    Pass,
    Fail { exit_code: i32, output: String },
}

impl TestResult {
    pub fn passed(&self) -> bool {
        matches!(self, TestResult::Pass)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestRunError {
    #[error("invalid test command: {0}")]
    InvalidCommand(String),
}

/// Split a command line and resolve its program against the prefix
fn prepare(command: &str, prefix: &Path) -> Result<(PathBuf, Vec<String>), TestRunError> {
    let mut words = shlex::split(command)
        .filter(|w| !w.is_empty())
        .ok_or_else(|| TestRunError::InvalidCommand(command.to_string()))?
        .into_iter();

    let program = words
        .next()
        .ok_or_else(|| TestRunError::InvalidCommand(command.to_string()))?;
    let program = PathBuf::from(program);
    let program = if program.is_relative() && program.components().count() > 1 {
        prefix.join(program)
    } else {
        program
    };

    Ok((program, words.collect()))
}

fn search_path(prefix: &Path) -> OsString {
    let mut dirs = vec![prefix.join("bin")];
    if let Some(existing) = std::env::var_os("PATH") {
        dirs.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(dirs).unwrap_or_else(|_| prefix.join("bin").into_os_string())
}

/// Run the smoke test and capture its exit code and combined output
pub async fn run_test(command: &str, prefix: &Path) -> Result<TestResult, TestRunError> {
    let (program, args) = prepare(command, prefix)?;
    debug!("Running test: {} {:?}", program.display(), args);

    let output = tokio::process::Command::new(&program)
        .args(&args)
        .env("PATH", search_path(prefix))
        .current_dir(prefix)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            return Ok(TestResult::Fail {
                exit_code: EXIT_NOT_RUNNABLE,
                output: format!("failed to run {}: {}", program.display(), e),
            });
        }
    };

    if output.status.success() {
        return Ok(TestResult::Pass);
    }

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(TestResult::Fail {
        exit_code: output.status.code().unwrap_or(EXIT_SIGNALLED),
        output: combined,
    })
}
