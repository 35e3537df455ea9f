use serde::Deserialize;
use std::{fmt, str::FromStr};

use crate::command::{Arg, CommandSpec};
use crate::error::{BuildError, Result};
use crate::params::{BuildInvocationParameters, BuildSettings};

pub const GITHUB_WORKSPACE: &str = "GITHUB_WORKSPACE";
pub const UNITY_SERIAL: &str = "UNITY_SERIAL";
pub const GIT_PRIVATE_TOKEN: &str = "GIT_PRIVATE_TOKEN";
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// Keys set from the invocation parameters that callers may not override.
pub const RESERVED_KEYS: [&str; 4] = [GITHUB_WORKSPACE, UNITY_SERIAL, GIT_PRIVATE_TOKEN, SSH_AUTH_SOCK];

/// Where the agent socket is mounted inside the container.
pub const CONTAINER_SSH_AGENT: &str = "/ssh-agent";

/// A caller-supplied `NAME=VALUE` pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EnvironmentPair {
    pub name: String,
    pub value: String,
}

impl EnvironmentPair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

impl FromStr for EnvironmentPair {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, value) = s
            .split_once('=')
            .ok_or_else(|| BuildError::Config(format!("expected NAME=VALUE, got '{s}'")))?;
        Ok(Self::new(name, value))
    }
}

/// One `--env` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvVar {
    /// `--env NAME`: the runtime forwards the host's value, if any.
    Inherit(String),
    Plain { name: String, value: String },
    /// Rendered as `NAME=***` everywhere except the spawned process.
    Secret { name: String, value: String },
}

impl EnvVar {
    fn plain(name: &str, value: impl Into<String>) -> Self {
        Self::Plain { name: name.to_string(), value: value.into() }
    }

    fn secret(name: &str, value: &str) -> Self {
        Self::Secret { name: name.to_string(), value: value.to_string() }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Inherit(name) | Self::Plain { name, .. } | Self::Secret { name, .. } => name,
        }
    }

    fn to_arg(&self) -> Arg {
        match self {
            Self::Inherit(name) => Arg::text(name.clone()),
            Self::Plain { name, value } => Arg::text(format!("{name}={value}")),
            Self::Secret { name, value } => Arg::text(format!("{name}=")).then_secret(value.clone()),
        }
    }
}

/// How the license serial is handled on a given host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialPolicy {
    /// Pass the value when configured, otherwise forward the host's variable by name.
    InheritWhenAbsent,
    /// The value must be configured.
    Required,
}

/// Host-specific inputs to serialization.
#[derive(Debug, Clone)]
pub struct EnvRules {
    /// `GITHUB_WORKSPACE` as the container sees it.
    pub workspace: String,
    pub serial: SerialPolicy,
    pub forward_ssh_agent: bool,
}

/// Ordered `--env` entries for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFragment {
    vars: Vec<EnvVar>,
}

impl EnvFragment {
    pub fn vars(&self) -> &[EnvVar] {
        &self.vars
    }

    /// Appends `--env <entry>` for every variable, in order.
    pub fn append_to(&self, spec: &mut CommandSpec) {
        for var in &self.vars {
            spec.flag("--env", var.to_arg());
        }
    }
}

impl fmt::Display for EnvFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .vars
            .iter()
            .map(|v| format!("--env {}", v.to_arg().redacted()))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// Builds the `--env` entries for an invocation.
///
/// Reserved parameter-derived variables come first, then build settings,
/// then caller pairs. Settings are defaults a caller pair may shadow, since
/// the runtime applies the last value given for a name. Caller pairs that
/// repeat a name collapse to the last value at the first position.
pub fn serialize_environment(
    params: &BuildInvocationParameters,
    rules: &EnvRules,
    additional: &[EnvironmentPair],
) -> Result<EnvFragment> {
    let mut vars = Vec::new();

    match (&params.unity_serial, rules.serial) {
        (Some(serial), _) => vars.push(EnvVar::secret(UNITY_SERIAL, serial.expose())),
        (None, SerialPolicy::InheritWhenAbsent) => vars.push(EnvVar::Inherit(UNITY_SERIAL.into())),
        (None, SerialPolicy::Required) => {
            return Err(BuildError::Config(format!(
                "{UNITY_SERIAL} is required on {} hosts",
                params.platform
            )))
        }
    }
    vars.push(EnvVar::plain(GITHUB_WORKSPACE, rules.workspace.as_str()));
    if let Some(token) = &params.git_private_token {
        vars.push(EnvVar::secret(GIT_PRIVATE_TOKEN, token.expose()));
    }
    if rules.forward_ssh_agent && params.ssh_agent.is_some() {
        vars.push(EnvVar::plain(SSH_AUTH_SOCK, CONTAINER_SSH_AGENT));
    }

    vars.extend(settings_vars(&params.settings));

    let mut extra: Vec<EnvVar> = Vec::new();
    for pair in additional {
        check_key(&pair.name)?;
        let var = EnvVar::plain(&pair.name, pair.value.clone());
        match extra.iter_mut().find(|v| v.name() == pair.name) {
            Some(slot) => *slot = var,
            None => extra.push(var),
        }
    }
    vars.extend(extra);

    Ok(EnvFragment { vars })
}

fn settings_vars(settings: &BuildSettings) -> Vec<EnvVar> {
    [
        ("PROJECT_PATH", &settings.project_path),
        ("BUILD_TARGET", &settings.target_platform),
        ("BUILD_NAME", &settings.build_name),
        ("BUILD_PATH", &settings.build_path),
        ("BUILD_FILE", &settings.build_file),
        ("BUILD_METHOD", &settings.build_method),
        ("VERSION", &settings.build_version),
        ("CUSTOM_PARAMETERS", &settings.custom_parameters),
        ("CHOWN_FILES_TO", &settings.chown_files_to),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.as_ref().map(|v| EnvVar::plain(name, v.clone())))
    .collect()
}

fn check_key(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('=') || name.chars().any(char::is_whitespace) {
        return Err(BuildError::Config(format!("invalid environment variable name '{name}'")));
    }
    if RESERVED_KEYS.contains(&name) {
        return Err(BuildError::ReservedKey { key: name.to_string() });
    }
    Ok(())
}
