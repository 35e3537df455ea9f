use std::{
    fs,
    path::{Path, PathBuf},
};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{host_path, under, BuildRequest, PlatformBuilder, RUNTIME};
use crate::command::{Arg, CommandSpec, QuoteStyle};
use crate::env::{EnvRules, SerialPolicy, CONTAINER_SSH_AGENT};
use crate::error::{BuildError, Result};
use crate::params::BuildInvocationParameters;
use crate::sanitize::{sanitize_mount_path, SymlinkPolicy};

const GITHUB_HOME: &str = "_github_home";
const GITHUB_WORKFLOW: &str = "_github_workflow";
const DEFAULT_ENTRYPOINT: &str = "/entrypoint.sh";
const MINIMAL_IMAGE: &str = "alpine";

pub struct LinuxBuilder;

impl LinuxBuilder {
    /// `/bin/sh` for the minimal image, `/bin/bash` for everything else.
    pub fn shell_for(image: &str) -> &'static str {
        if image_name(image) == MINIMAL_IMAGE {
            "/bin/sh"
        } else {
            "/bin/bash"
        }
    }
}

/// Repository name of an image reference without registry, tag or digest.
fn image_name(image: &str) -> &str {
    let without_digest = image.split('@').next().unwrap_or(image);
    let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
    last.split(':').next().unwrap_or(last)
}

#[async_trait::async_trait]
impl PlatformBuilder for LinuxBuilder {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn env_rules(&self, params: &BuildInvocationParameters) -> EnvRules {
        EnvRules {
            workspace: params.docker_workspace_path.clone(),
            serial: SerialPolicy::InheritWhenAbsent,
            forward_ssh_agent: true,
        }
    }

    async fn prepare(&self, params: &BuildInvocationParameters, symlinks: SymlinkPolicy) -> Result<PathBuf> {
        for dir in [GITHUB_HOME, GITHUB_WORKFLOW] {
            let path = params.runner_temp_path.join(dir);
            if !path.exists() {
                fs::create_dir(&path).map_err(|source| BuildError::Duplication {
                    action: "creating",
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let action_folder = sanitize_mount_path(&params.action_folder, symlinks)?;
        list_directory(&action_folder).await;
        Ok(action_folder)
    }

    fn build(&self, request: &BuildRequest<'_>) -> Result<CommandSpec> {
        let params = request.params;
        let action = request.action_folder;
        let workspace = &params.docker_workspace_path;
        let shell = Self::shell_for(&params.image);

        let mut cmd = CommandSpec::new(RUNTIME, QuoteStyle::Posix);
        cmd.arg("run").flag("--workdir", workspace.as_str()).arg("--rm");
        request.env.append_to(&mut cmd);

        let github_home = params.runner_temp_path.join(GITHUB_HOME);
        let github_workflow = params.runner_temp_path.join(GITHUB_WORKFLOW);
        cmd.flag("--volume", format!("{}:/root:z", host_path(&github_home)))
            .flag("--volume", format!("{}:/github/workflow:z", host_path(&github_workflow)))
            .flag("--volume", format!("{}:{workspace}:z", host_path(&params.workspace)))
            .flag("--volume", format!("{}:/UnityBuilderAction:z", under(action, "default-build-script")))
            .flag("--volume", format!("{}:/steps:z", under(action, "platforms/ubuntu/steps")))
            .flag("--volume", format!("{}:{DEFAULT_ENTRYPOINT}:z", under(action, "platforms/ubuntu/entrypoint.sh")))
            .flag("--volume", format!("{}:/usr/share/unity3d/config/:z", under(action, "unity-config")));

        if let Some(agent) = &params.ssh_agent {
            cmd.flag("--volume", Arg::secret(host_path(agent)).then_text(format!(":{CONTAINER_SSH_AGENT}")))
                .flag(
                    "--volume",
                    format!("{}:/root/.ssh/known_hosts:ro", host_path(&params.ssh_known_hosts)),
                );
        }

        if request.entrypoint_shell {
            cmd.flag("--entrypoint", shell);
        }
        cmd.arg(params.image.as_str());
        if !request.entrypoint_shell {
            cmd.arg(shell);
        }
        cmd.arg("-c").arg(request.override_command.unwrap_or(DEFAULT_ENTRYPOINT));
        Ok(cmd)
    }
}

/// Logs `ls -l` of the mounted action folder. Never fails the build.
async fn list_directory(dir: &Path) {
    match Command::new("ls").arg("-l").arg(dir).output().await {
        Ok(out) if out.status.success() => {
            debug!(dir = %dir.display(), "{}", String::from_utf8_lossy(&out.stdout).trim_end());
        }
        Ok(out) => warn!(dir = %dir.display(), status = %out.status, "listing action folder failed"),
        Err(e) => warn!(dir = %dir.display(), "could not run ls: {e}"),
    }
}
