use serde::Deserialize;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use crate::error::{BuildError, Result};

pub const DEFAULT_DOCKER_WORKSPACE: &str = "/github/workspace";
const FALLBACK_KNOWN_HOSTS: &str = "/home/runner/.ssh/known_hosts";

/// A secret string. Formatting never shows the value; call [`Secret::expose`]
/// where the real value has to cross into the container.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Host the container runtime is driven from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPlatform {
    Linux,
    Windows,
    Other(String),
}

impl HostPlatform {
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    pub fn from_os(os: &str) -> Self {
        match os {
            "linux" => Self::Linux,
            "windows" => Self::Windows,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Other(os) => os,
        }
    }
}

impl fmt::Display for HostPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional knobs forwarded to the build scripts inside the container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BuildSettings {
    pub project_path: Option<String>,
    pub target_platform: Option<String>,
    pub build_name: Option<String>,
    pub build_path: Option<String>,
    pub build_file: Option<String>,
    pub build_method: Option<String>,
    pub build_version: Option<String>,
    pub custom_parameters: Option<String>,
    pub chown_files_to: Option<String>,
}

/// Everything one build invocation needs. Constructed once, never mutated.
#[derive(Debug, Clone)]
pub struct BuildInvocationParameters {
    pub workspace: PathBuf,
    pub action_folder: PathBuf,
    pub runner_temp_path: PathBuf,
    /// Container-side path; unrelated to the host layout.
    pub docker_workspace_path: String,
    pub image: String,
    pub ssh_agent: Option<PathBuf>,
    pub ssh_known_hosts: PathBuf,
    pub git_private_token: Option<Secret>,
    pub unity_serial: Option<Secret>,
    pub settings: BuildSettings,
    pub platform: HostPlatform,
}

impl BuildInvocationParameters {
    /// Parameters with defaults for everything optional, on the current host.
    pub fn new(
        workspace: impl Into<PathBuf>,
        action_folder: impl Into<PathBuf>,
        runner_temp_path: impl Into<PathBuf>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            action_folder: action_folder.into(),
            runner_temp_path: runner_temp_path.into(),
            docker_workspace_path: DEFAULT_DOCKER_WORKSPACE.to_string(),
            image: image.into(),
            ssh_agent: None,
            ssh_known_hosts: default_known_hosts(),
            git_private_token: None,
            unity_serial: None,
            settings: BuildSettings::default(),
            platform: HostPlatform::current(),
        }
    }

    /// Checks the host paths exist and are absolute and that the
    /// container-side workspace is an absolute container path.
    pub fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("workspace", &self.workspace),
            ("action folder", &self.action_folder),
            ("runner temp path", &self.runner_temp_path),
        ] {
            if !path.is_absolute() {
                return Err(BuildError::Config(format!(
                    "{name} '{}' must be an absolute path",
                    path.display()
                )));
            }
            if !path.exists() {
                return Err(BuildError::Config(format!(
                    "{name} '{}' does not exist",
                    path.display()
                )));
            }
        }

        if !self.docker_workspace_path.starts_with('/') {
            return Err(BuildError::Config(format!(
                "docker workspace path '{}' must be absolute",
                self.docker_workspace_path
            )));
        }

        if self.image.trim().is_empty() {
            return Err(BuildError::Config("image reference is empty".into()));
        }
        Ok(())
    }
}

/// `$HOME/.ssh/known_hosts`, or the hosted-runner location when there is no home.
pub fn default_known_hosts() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_KNOWN_HOSTS))
}

/// On-disk form of the parameters. Every field is optional so the CLI can
/// layer flags and environment variables on top of it.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParamsFile {
    pub workspace: Option<PathBuf>,
    pub action_folder: Option<PathBuf>,
    pub runner_temp_path: Option<PathBuf>,
    pub docker_workspace_path: Option<String>,
    pub image: Option<String>,
    pub ssh_agent: Option<PathBuf>,
    pub ssh_known_hosts: Option<PathBuf>,
    pub git_private_token: Option<Secret>,
    pub unity_serial: Option<Secret>,
    pub settings: BuildSettings,
}

impl ParamsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let txt = fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!("reading parameters file '{}': {e}", path.display()))
        })?;
        serde_json::from_str(&txt).map_err(|e| {
            BuildError::Config(format!("parsing parameters file '{}': {e}", path.display()))
        })
    }
}
