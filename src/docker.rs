use tracing::info;

use crate::command::CommandSpec;
use crate::env::{serialize_environment, EnvironmentPair};
use crate::error::Result;
use crate::exec::{ensure_program, execute, ExecOptions, ExecutionResult, ResultMarker};
use crate::params::BuildInvocationParameters;
use crate::platforms::{select_builder, BuildRequest, PlatformBuilder, RUNTIME};
use crate::sanitize::SymlinkPolicy;

/// Per-invocation knobs that are not part of the build parameters.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub override_command: Option<String>,
    pub additional_variables: Vec<EnvironmentPair>,
    pub entrypoint_shell: bool,
    pub symlinks: SymlinkPolicy,
    pub exec: ExecOptions,
}

/// Everything up to execution: validates, prepares mounts and returns the
/// command that would run.
pub async fn plan_build(params: &BuildInvocationParameters, opts: &RunOptions) -> Result<CommandSpec> {
    params.validate()?;
    let builder = select_builder(&params.platform)?;
    assemble(builder.as_ref(), params, opts).await
}

/// Runs one build: prepare mounts, serialize the environment, build the
/// platform command, execute it and check the result.
pub async fn run_build(
    params: &BuildInvocationParameters,
    opts: &RunOptions,
    marker: &dyn ResultMarker,
) -> Result<ExecutionResult> {
    params.validate()?;
    let builder = select_builder(&params.platform)?;
    ensure_program(RUNTIME)?;

    let spec = assemble(builder.as_ref(), params, opts).await?;
    let result = execute(&spec, &opts.exec, marker).await?;
    info!(image = %params.image, "build container finished");
    Ok(result)
}

async fn assemble(
    builder: &dyn PlatformBuilder,
    params: &BuildInvocationParameters,
    opts: &RunOptions,
) -> Result<CommandSpec> {
    info!(platform = builder.name(), image = %params.image, "preparing build");
    let action_folder = builder.prepare(params, opts.symlinks).await?;
    let env = serialize_environment(params, &builder.env_rules(params), &opts.additional_variables)?;

    builder.build(&BuildRequest {
        params,
        action_folder: &action_folder,
        env: &env,
        override_command: opts.override_command.as_deref().filter(|c| !c.is_empty()),
        entrypoint_shell: opts.entrypoint_shell,
    })
}
