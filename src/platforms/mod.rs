pub mod linux;
pub mod windows;

use std::path::{Path, PathBuf};

use crate::command::CommandSpec;
use crate::env::{EnvFragment, EnvRules};
use crate::error::{BuildError, Result};
use crate::params::{BuildInvocationParameters, HostPlatform};
use crate::sanitize::SymlinkPolicy;

pub use linux::LinuxBuilder;
pub use windows::WindowsBuilder;

/// Container runtime CLI the action bundles are written against.
pub const RUNTIME: &str = "docker";

/// Inputs to [`PlatformBuilder::build`].
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub params: &'a BuildInvocationParameters,
    /// Action folder as returned by [`PlatformBuilder::prepare`].
    pub action_folder: &'a Path,
    pub env: &'a EnvFragment,
    /// Replaces the default entrypoint script.
    pub override_command: Option<&'a str>,
    /// Run the image with the shell as its entrypoint instead of passing the
    /// shell as the container command.
    pub entrypoint_shell: bool,
}

/// Per-host rules for turning parameters into a `docker run` invocation.
#[async_trait::async_trait]
pub trait PlatformBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    /// How the environment is serialized for this host.
    fn env_rules(&self, params: &BuildInvocationParameters) -> EnvRules;

    /// Host-side setup needed before the command can run. Returns the
    /// action folder path to mount.
    async fn prepare(&self, params: &BuildInvocationParameters, symlinks: SymlinkPolicy) -> Result<PathBuf>;

    /// Assembles the command. Pure: same request, same command.
    fn build(&self, request: &BuildRequest<'_>) -> Result<CommandSpec>;
}

/// Picks the builder for `platform`, once per invocation.
pub fn select_builder(platform: &HostPlatform) -> Result<Box<dyn PlatformBuilder>> {
    match platform {
        HostPlatform::Linux => Ok(Box::new(LinuxBuilder)),
        HostPlatform::Windows => Ok(Box::new(WindowsBuilder)),
        HostPlatform::Other(os) => Err(BuildError::UnsupportedPlatform { platform: os.clone() }),
    }
}

/// `root/rel` with forward slashes, as docker's `--volume` expects on both hosts.
pub(crate) fn under(root: &Path, rel: &str) -> String {
    format!("{}/{rel}", root.to_string_lossy().trim_end_matches(['/', '\\']))
}

pub(crate) fn host_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
