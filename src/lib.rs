//! Builds and runs the `docker run` invocation for one CI build.
//!
//! Parameters are validated, the action folder is made mountable,
//! the environment is serialized, the host's [`platforms::PlatformBuilder`]
//! assembles a [`command::CommandSpec`] and [`exec`] runs it.

pub mod command;
pub mod docker;
pub mod env;
pub mod error;
pub mod exec;
pub mod params;
pub mod platforms;
pub mod sanitize;

pub use command::{Arg, CommandSpec, QuoteStyle};
pub use docker::{plan_build, run_build, RunOptions};
pub use env::{serialize_environment, EnvironmentPair};
pub use error::{BuildError, Result};
pub use exec::{Console, ExecOptions, ExecutionResult, OutputSink, ResultMarker, Stream, TextMarker};
pub use params::{BuildInvocationParameters, BuildSettings, HostPlatform, Secret};
pub use sanitize::{sanitize_mount_path, SymlinkPolicy};
