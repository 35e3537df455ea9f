use std::path::PathBuf;
use tracing::debug;

use super::{host_path, under, BuildRequest, PlatformBuilder, RUNTIME};
use crate::command::{CommandSpec, QuoteStyle};
use crate::env::{EnvRules, SerialPolicy};
use crate::error::Result;
use crate::params::BuildInvocationParameters;
use crate::sanitize::SymlinkPolicy;

const STEP_RUNNER: &str = "c:/steps/entrypoint.ps1";

/// Toolchain directories shared into the container at the same path.
const HOST_MOUNTS: [&str; 4] = [
    "c:/regkeys",
    "C:/Program Files (x86)/Microsoft Visual Studio",
    "C:/Program Files (x86)/Windows Kits",
    "C:/ProgramData/Microsoft/VisualStudio",
];

pub struct WindowsBuilder;

impl WindowsBuilder {
    fn container_workspace(params: &BuildInvocationParameters) -> String {
        format!("c:{}", params.docker_workspace_path)
    }
}

#[async_trait::async_trait]
impl PlatformBuilder for WindowsBuilder {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn env_rules(&self, params: &BuildInvocationParameters) -> EnvRules {
        EnvRules {
            workspace: Self::container_workspace(params),
            serial: SerialPolicy::Required,
            forward_ssh_agent: false,
        }
    }

    async fn prepare(&self, params: &BuildInvocationParameters, _symlinks: SymlinkPolicy) -> Result<PathBuf> {
        Ok(params.action_folder.clone())
    }

    fn build(&self, request: &BuildRequest<'_>) -> Result<CommandSpec> {
        let params = request.params;
        let action = request.action_folder;
        let workspace = Self::container_workspace(params);

        if request.override_command.is_some() || request.entrypoint_shell {
            debug!("command override and entrypoint shell do not apply on windows hosts");
        }

        let mut cmd = CommandSpec::new(RUNTIME, QuoteStyle::PowerShell);
        cmd.arg("run").flag("--workdir", workspace.as_str()).arg("--rm");
        request.env.append_to(&mut cmd);

        cmd.flag("--volume", format!("{}:{workspace}", host_path(&params.workspace)));
        for dir in HOST_MOUNTS {
            cmd.flag("--volume", format!("{dir}:{dir}"));
        }
        cmd.flag("--volume", format!("{}:c:/UnityBuilderAction", under(action, "default-build-script")))
            .flag("--volume", format!("{}:c:/steps", under(action, "platforms/windows")))
            .flag("--volume", format!("{}:c:/BlankProject", under(action, "BlankProject")));

        cmd.arg(params.image.as_str()).arg("powershell").arg(STEP_RUNNER);
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{serialize_environment, GITHUB_WORKSPACE, UNITY_SERIAL};
    use crate::error::BuildError;
    use crate::params::{HostPlatform, Secret};

    fn params() -> BuildInvocationParameters {
        let mut p = BuildInvocationParameters::new("D:/a/game", "D:/a/_actions/builder@v4", "D:/a/_temp", "unityci/editor:windows");
        p.platform = HostPlatform::Windows;
        p.unity_serial = Some(Secret::new("SERIAL-XYZ"));
        p
    }

    fn build(p: &BuildInvocationParameters) -> CommandSpec {
        let env = serialize_environment(p, &WindowsBuilder.env_rules(p), &[]).unwrap();
        WindowsBuilder
            .build(&BuildRequest {
                params: p,
                action_folder: &p.action_folder,
                env: &env,
                override_command: Some("ignored"),
                entrypoint_shell: true,
            })
            .unwrap()
    }

    #[test]
    fn windows_command_line() {
        let cmd = build(&params());
        assert_eq!(
            cmd.redacted(),
            "docker run --workdir c:/github/workspace --rm \
             --env \"UNITY_SERIAL=***\" --env GITHUB_WORKSPACE=c:/github/workspace \
             --volume D:/a/game:c:/github/workspace \
             --volume c:/regkeys:c:/regkeys \
             --volume \"C:/Program Files (x86)/Microsoft Visual Studio:C:/Program Files (x86)/Microsoft Visual Studio\" \
             --volume \"C:/Program Files (x86)/Windows Kits:C:/Program Files (x86)/Windows Kits\" \
             --volume C:/ProgramData/Microsoft/VisualStudio:C:/ProgramData/Microsoft/VisualStudio \
             --volume \"D:/a/_actions/builder@v4/default-build-script:c:/UnityBuilderAction\" \
             --volume \"D:/a/_actions/builder@v4/platforms/windows:c:/steps\" \
             --volume \"D:/a/_actions/builder@v4/BlankProject:c:/BlankProject\" \
             unityci/editor:windows powershell c:/steps/entrypoint.ps1"
        );
        assert!(cmd.argv().contains(&format!("{UNITY_SERIAL}=SERIAL-XYZ")));
    }

    #[test]
    fn serial_is_mandatory() {
        let mut p = params();
        p.unity_serial = None;
        let err = serialize_environment(&p, &WindowsBuilder.env_rules(&p), &[]).unwrap_err();
        assert!(matches!(err, BuildError::Config(ref m) if m.contains(UNITY_SERIAL)));
    }

    #[test]
    fn ssh_agent_is_not_forwarded() {
        let mut p = params();
        p.ssh_agent = Some(PathBuf::from("//./pipe/openssh-ssh-agent"));
        let argv = build(&p).argv();
        assert!(!argv.iter().any(|a| a.contains("ssh")));
        assert!(argv.iter().any(|a| a.starts_with(GITHUB_WORKSPACE)));
    }

    #[tokio::test]
    async fn prepare_leaves_action_folder_alone() {
        let p = params();
        assert_eq!(WindowsBuilder.prepare(&p, SymlinkPolicy::Follow).await.unwrap(), p.action_folder);
    }
}
