use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Every way a single build invocation can fail.
///
/// None of these are retried here. Secret values never reach a message:
/// commands are carried in their redacted rendering and process output is
/// masked before it is stored.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("unsupported platform '{platform}': no docker command rule is defined for this host")]
    UnsupportedPlatform { platform: String },

    #[error("failed {action} '{}': {source}", path.display())]
    Duplication {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("symbolic link cycle detected at '{}'", path.display())]
    SymlinkCycle { path: PathBuf },

    #[error("symbolic link '{}' rejected by copy policy", path.display())]
    SymlinkRejected { path: PathBuf },

    #[error("cannot copy special file '{}'", path.display())]
    UnsupportedEntry { path: PathBuf },

    #[error("command failed with {}: {command}\n{output}", describe_code(*code))]
    ProcessFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("build finished without producing results ({marker} not found in output): {command}")]
    MissingBuildResult { command: String, marker: String },

    #[error("failed to start '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while running '{command}': {source}")]
    ProcessIo {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("'{program}' not found on PATH")]
    RuntimeNotFound { program: String },

    #[error("environment variable '{key}' is reserved and cannot be overridden")]
    ReservedKey { key: String },

    #[error("invalid build parameters: {0}")]
    Config(String),
}

pub type Result<T, E = BuildError> = std::result::Result<T, E>;

fn describe_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
