use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docker_builder::{
    params::{default_known_hosts, ParamsFile, DEFAULT_DOCKER_WORKSPACE},
    plan_build, run_build, BuildInvocationParameters, EnvironmentPair, ExecOptions, HostPlatform,
    RunOptions, Secret, SymlinkPolicy, TextMarker,
};

#[derive(Parser, Debug)]
#[command(name = "docker-builder", version, about = "Run a CI build inside a docker container")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prepare mounts, run the build container and check its result
    Run {
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        exec: ExecArgs,
    },
    /// Prepare mounts and print the (redacted) docker command without running it
    Plan {
        #[command(flatten)]
        build: BuildArgs,
    },
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// JSON file with build parameters; flags and env vars take precedence
    #[arg(long)]
    params: Option<PathBuf>,
    #[arg(long, env = "GITHUB_WORKSPACE")]
    workspace: Option<PathBuf>,
    #[arg(long, env = "GITHUB_ACTION_PATH")]
    action_folder: Option<PathBuf>,
    #[arg(long, env = "RUNNER_TEMP")]
    runner_temp: Option<PathBuf>,
    /// Workspace path inside the container
    #[arg(long)]
    docker_workspace: Option<String>,
    #[arg(long)]
    image: Option<String>,
    #[arg(long, env = "SSH_AGENT")]
    ssh_agent: Option<PathBuf>,
    #[arg(long)]
    ssh_known_hosts: Option<PathBuf>,
    #[arg(long, env = "GIT_PRIVATE_TOKEN", hide_env_values = true)]
    git_private_token: Option<String>,
    #[arg(long, env = "UNITY_SERIAL", hide_env_values = true)]
    unity_serial: Option<String>,
    /// Extra container environment, NAME=VALUE (repeatable)
    #[arg(short = 'e', long = "env", value_name = "NAME=VALUE")]
    env: Vec<EnvironmentPair>,
    /// Run this instead of the default entrypoint script
    #[arg(long = "command")]
    override_command: Option<String>,
    /// Use the shell as the container entrypoint
    #[arg(long)]
    entrypoint_shell: bool,
    #[arg(long, value_enum, default_value_t = Symlinks::Follow)]
    symlinks: Symlinks,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Don't echo container output
    #[arg(long)]
    silent: bool,
    /// Accept a zero exit code even when no build result was reported
    #[arg(long)]
    no_result_check: bool,
    /// Text whose presence in stdout marks a successful build
    #[arg(long, default_value = docker_builder::exec::DEFAULT_RESULT_MARKER)]
    result_marker: String,
    #[arg(long)]
    cwd: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Symlinks {
    Follow,
    Skip,
    Reject,
}

impl From<Symlinks> for SymlinkPolicy {
    fn from(s: Symlinks) -> Self {
        match s {
            Symlinks::Follow => SymlinkPolicy::Follow,
            Symlinks::Skip => SymlinkPolicy::Skip,
            Symlinks::Reject => SymlinkPolicy::Reject,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("DOCKER_BUILDER_LOG").unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Run { build, exec } => cmd_run(build, exec).await?,
        Commands::Plan { build } => cmd_plan(build).await?,
    }
    Ok(())
}

async fn cmd_run(build: BuildArgs, exec: ExecArgs) -> Result<()> {
    let params = resolve_params(&build)?;
    let mut opts = run_options(build);
    opts.exec = ExecOptions {
        cwd: exec.cwd,
        silent: exec.silent,
        fail_on_missing_result: !exec.no_result_check,
        ..ExecOptions::default()
    };
    let marker = TextMarker(exec.result_marker);

    let result = run_build(&params, &opts, &marker).await.context("build failed")?;
    println!("✓ Build container exited with {:?}", result.exit_code);
    Ok(())
}

async fn cmd_plan(build: BuildArgs) -> Result<()> {
    let params = resolve_params(&build)?;
    let opts = run_options(build);
    let spec = plan_build(&params, &opts).await.context("planning build")?;
    println!("{spec}");
    Ok(())
}

fn run_options(build: BuildArgs) -> RunOptions {
    RunOptions {
        override_command: build.override_command,
        additional_variables: build.env,
        entrypoint_shell: build.entrypoint_shell,
        symlinks: build.symlinks.into(),
        exec: ExecOptions::default(),
    }
}

/// Flags and env vars first, then the parameters file, then defaults.
fn resolve_params(args: &BuildArgs) -> Result<BuildInvocationParameters> {
    let file = match &args.params {
        Some(path) => ParamsFile::load(path)?,
        None => ParamsFile::default(),
    };

    let required = |flag: Option<PathBuf>, from_file: Option<PathBuf>, name: &str| {
        flag.or(from_file).ok_or_else(|| anyhow!("missing --{name} (or '{name}' in the parameters file)"))
    };

    let workspace = required(args.workspace.clone(), file.workspace, "workspace")?;
    let action_folder = required(args.action_folder.clone(), file.action_folder, "action-folder")?;
    let runner_temp = required(args.runner_temp.clone(), file.runner_temp_path, "runner-temp")?;
    let image = args
        .image
        .clone()
        .or(file.image)
        .ok_or_else(|| anyhow!("missing --image (or 'image' in the parameters file)"))?;

    Ok(BuildInvocationParameters {
        workspace,
        action_folder,
        runner_temp_path: runner_temp,
        docker_workspace_path: args
            .docker_workspace
            .clone()
            .or(file.docker_workspace_path)
            .unwrap_or_else(|| DEFAULT_DOCKER_WORKSPACE.to_string()),
        image,
        ssh_agent: args.ssh_agent.clone().or(file.ssh_agent),
        ssh_known_hosts: args
            .ssh_known_hosts
            .clone()
            .or(file.ssh_known_hosts)
            .unwrap_or_else(default_known_hosts),
        git_private_token: args.git_private_token.clone().map(Secret::new).or(file.git_private_token),
        unity_serial: args.unity_serial.clone().map(Secret::new).or(file.unity_serial),
        settings: file.settings,
        platform: HostPlatform::current(),
    })
}
