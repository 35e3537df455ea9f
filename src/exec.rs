use std::{collections::VecDeque, fmt, path::PathBuf, process::Stdio, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tracing::{debug, info};

use crate::command::CommandSpec;
use crate::error::{BuildError, Result};

pub const DEFAULT_RESULT_MARKER: &str = "Build succeeded";

/// Lines of stderr kept for the result and for failure messages.
pub const DEFAULT_STDERR_TAIL: usize = 200;

/// Decides whether a build that exited 0 actually produced results.
pub trait ResultMarker: Send + Sync {
    fn is_present(&self, stdout: &str) -> bool;
    /// Human-readable name used in the failure message.
    fn describe(&self) -> String;
}

/// Looks for a line of text anywhere in stdout.
#[derive(Debug, Clone)]
pub struct TextMarker(pub String);

impl Default for TextMarker {
    fn default() -> Self {
        Self(DEFAULT_RESULT_MARKER.to_string())
    }
}

impl ResultMarker for TextMarker {
    fn is_present(&self, stdout: &str) -> bool {
        stdout.contains(&self.0)
    }

    fn describe(&self) -> String {
        format!("'{}'", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives the container's output one line at a time, already masked.
pub trait OutputSink: Send + Sync {
    fn line(&self, stream: Stream, line: &str);
}

/// Echoes to this process's own stdout and stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct Console;

impl OutputSink for Console {
    fn line(&self, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => println!("{line}"),
            Stream::Stderr => eprintln!("{line}"),
        }
    }
}

#[derive(Clone)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    /// Capture only; don't forward the container's output anywhere.
    pub silent: bool,
    /// Treat a zero exit without the result marker as failure.
    pub fail_on_missing_result: bool,
    /// Where output goes when not silent. `None` means [`Console`].
    pub sink: Option<Arc<dyn OutputSink>>,
    /// How many trailing stderr lines to keep. Stdout is kept whole for
    /// the result marker.
    pub stderr_tail: usize,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            silent: false,
            fail_on_missing_result: true,
            sink: None,
            stderr_tail: DEFAULT_STDERR_TAIL,
        }
    }
}

impl fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecOptions")
            .field("cwd", &self.cwd)
            .field("silent", &self.silent)
            .field("fail_on_missing_result", &self.fail_on_missing_result)
            .field("sink", &self.sink.as_ref().map(|_| "custom"))
            .field("stderr_tail", &self.stderr_tail)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    ProcessFailed,
    MissingBuildResult,
}

/// What one run of a command produced. Output is already masked.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Redacted rendering of the command.
    pub command: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// Trailing lines of stderr only.
    pub stderr: String,
    pub outcome: Outcome,
    marker: String,
    tail: usize,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    /// Converts a failed outcome into its error.
    pub fn into_result(self) -> Result<Self> {
        match self.outcome {
            Outcome::Success => Ok(self),
            Outcome::ProcessFailed => {
                let output = if self.stderr.trim().is_empty() {
                    last_lines(&self.stdout, self.tail)
                } else {
                    self.stderr.as_str()
                };
                Err(BuildError::ProcessFailed {
                    command: self.command.clone(),
                    code: self.exit_code,
                    output: output.trim().to_string(),
                })
            }
            Outcome::MissingBuildResult => Err(BuildError::MissingBuildResult {
                command: self.command.clone(),
                marker: self.marker.clone(),
            }),
        }
    }
}

/// Fails with [`BuildError::RuntimeNotFound`] unless `program` is on PATH.
pub fn ensure_program(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|_| BuildError::RuntimeNotFound { program: program.to_string() })
}

/// Runs `spec` to completion and classifies the result, without turning it
/// into an error. Only failing to start the process is an `Err`.
pub async fn run(spec: &CommandSpec, opts: &ExecOptions, marker: &dyn ResultMarker) -> Result<ExecutionResult> {
    let shown = spec.redacted();
    info!(command = %shown, "running");

    let mut cmd = Command::new(spec.program());
    cmd.args(spec.argv())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }

    let mut child = cmd.spawn().map_err(|source| BuildError::Spawn { command: shown.clone(), source })?;
    let io_err = |source: std::io::Error| BuildError::ProcessIo { command: shown.clone(), source };

    let stdout = child.stdout.take().ok_or_else(|| io_err(broken_pipe("stdout")))?;
    let stderr = child.stderr.take().ok_or_else(|| io_err(broken_pipe("stderr")))?;

    let sink: Option<&dyn OutputSink> = if opts.silent {
        None
    } else {
        Some(opts.sink.as_deref().unwrap_or(&Console))
    };
    let (out, err, status) = tokio::join!(
        pump(stdout, spec, sink, Stream::Stdout, None),
        pump(stderr, spec, sink, Stream::Stderr, Some(opts.stderr_tail)),
        child.wait(),
    );
    let status = status.map_err(io_err)?;
    // masked whole so secrets spanning lines are caught too
    let stdout = spec.mask(&out.map_err(io_err)?);
    let stderr = spec.mask(&err.map_err(io_err)?);

    let outcome = if !status.success() {
        Outcome::ProcessFailed
    } else if opts.fail_on_missing_result && !marker.is_present(&stdout) {
        Outcome::MissingBuildResult
    } else {
        Outcome::Success
    };
    debug!(code = ?status.code(), ?outcome, "command finished");

    Ok(ExecutionResult {
        command: shown,
        exit_code: status.code(),
        stdout,
        stderr,
        outcome,
        marker: marker.describe(),
        tail: opts.stderr_tail,
    })
}

/// Runs `spec` and fails on a nonzero exit, or on a missing result marker
/// when that check is enabled.
pub async fn execute(spec: &CommandSpec, opts: &ExecOptions, marker: &dyn ResultMarker) -> Result<ExecutionResult> {
    run(spec, opts, marker).await?.into_result()
}

/// Forwards each line to `sink` masked and returns the raw lines, only the
/// last `keep` of them when a limit is given.
async fn pump<R>(
    reader: R,
    spec: &CommandSpec,
    sink: Option<&dyn OutputSink>,
    stream: Stream,
    keep: Option<usize>,
) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    // split on bytes: build logs are not always valid UTF-8
    let mut lines = BufReader::new(reader).split(b'\n');
    let mut captured = VecDeque::new();
    let mut dropped = 0usize;
    while let Some(raw) = lines.next_segment().await? {
        let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
        if let Some(sink) = sink {
            sink.line(stream, &spec.mask(&line));
        }
        match keep {
            Some(0) => dropped += 1,
            Some(limit) if captured.len() == limit => {
                captured.pop_front();
                captured.push_back(line);
                dropped += 1;
            }
            _ => captured.push_back(line),
        }
    }
    if dropped > 0 {
        debug!(?stream, dropped, "dropped leading output lines");
    }
    Ok(captured.into_iter().map(|l| l + "\n").collect())
}

fn last_lines(text: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let text = text.trim_end();
    match text.rmatch_indices('\n').nth(n - 1) {
        Some((i, _)) => &text[i + 1..],
        None => text,
    }
}

fn broken_pipe(stream: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("{stream} was not captured"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::command::{Arg, QuoteStyle};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn sh(script: &str) -> CommandSpec {
        let mut spec = CommandSpec::new("/bin/sh", QuoteStyle::Posix);
        spec.arg("-c").arg(script);
        spec
    }

    fn quiet() -> ExecOptions {
        ExecOptions { silent: true, ..ExecOptions::default() }
    }

    fn unchecked() -> ExecOptions {
        ExecOptions { fail_on_missing_result: false, ..quiet() }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<(Stream, String)>>);

    impl OutputSink for Collect {
        fn line(&self, stream: Stream, line: &str) {
            self.0.lock().unwrap().push((stream, line.to_string()));
        }
    }

    #[tokio::test]
    async fn zero_exit_with_marker_succeeds() {
        let result = execute(&sh("echo 'Build succeeded'"), &quiet(), &TextMarker::default()).await.unwrap();
        assert!(result.success());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout, "Build succeeded\n");
    }

    #[tokio::test]
    async fn zero_exit_without_marker_fails_when_checked() {
        let err = execute(&sh("echo done"), &quiet(), &TextMarker::default()).await.unwrap_err();
        match err {
            BuildError::MissingBuildResult { marker, command } => {
                assert_eq!(marker, "'Build succeeded'");
                assert!(command.starts_with("/bin/sh -c"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn zero_exit_without_marker_passes_when_unchecked() {
        let opts = ExecOptions { fail_on_missing_result: false, ..quiet() };
        let result = execute(&sh("echo done"), &opts, &TextMarker::default()).await.unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn nonzero_exit_fails_regardless_of_marker() {
        let spec = sh("echo 'Build succeeded'; echo 'license activation failed' >&2; exit 2");
        let err = execute(&spec, &quiet(), &TextMarker::default()).await.unwrap_err();
        match err {
            BuildError::ProcessFailed { code, output, .. } => {
                assert_eq!(code, Some(2));
                assert_eq!(output, "license activation failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failure_falls_back_to_stdout() {
        let err = execute(&sh("echo only stdout; exit 3"), &quiet(), &TextMarker::default()).await.unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
        assert!(err.to_string().ends_with("only stdout"));
    }

    #[tokio::test]
    async fn run_reports_outcome_without_erroring() {
        let result = run(&sh("exit 2"), &quiet(), &TextMarker::default()).await.unwrap();
        assert_eq!(result.outcome, Outcome::ProcessFailed);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn secrets_are_masked_in_output_and_errors() {
        let mut spec = CommandSpec::new("/bin/sh", QuoteStyle::Posix);
        spec.arg("-c")
            .arg("echo \"token is $1\" >&2; exit 1")
            .arg("sh")
            .arg(Arg::secret("ghp_leaky"));
        let err = execute(&spec, &quiet(), &TextMarker::default()).await.unwrap_err();
        let msg = err.to_string();
        assert!(!msg.contains("ghp_leaky"));
        assert!(msg.contains("token is ***"));
    }

    #[tokio::test]
    async fn cwd_is_applied() {
        let dir = TempDir::new().unwrap();
        let opts = ExecOptions { cwd: Some(dir.path().to_path_buf()), ..quiet() };
        execute(&sh("touch marker && echo 'Build succeeded'"), &opts, &TextMarker::default()).await.unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spec = CommandSpec::new("/definitely/not/here", QuoteStyle::Posix);
        let err = execute(&spec, &quiet(), &TextMarker::default()).await.unwrap_err();
        assert!(matches!(err, BuildError::Spawn { .. }));
    }

    #[test]
    fn ensure_program_finds_sh() {
        assert!(ensure_program("sh").is_ok());
        assert!(matches!(
            ensure_program("no-such-runtime-binary"),
            Err(BuildError::RuntimeNotFound { .. })
        ));
    }

    struct FileMarker(PathBuf);

    impl ResultMarker for FileMarker {
        fn is_present(&self, _stdout: &str) -> bool {
            self.0.exists()
        }
        fn describe(&self) -> String {
            format!("result file {}", self.0.display())
        }
    }

    #[tokio::test]
    async fn custom_markers_are_consulted() {
        let dir = TempDir::new().unwrap();
        let marker = FileMarker(dir.path().join("build.ok"));
        let script = format!("touch {}", dir.path().join("build.ok").display());
        execute(&sh(&script), &quiet(), &marker).await.unwrap();
    }

    #[tokio::test]
    async fn rendered_line_is_reparsed_by_sh() {
        let mut inner = CommandSpec::new("printf", QuoteStyle::Posix);
        inner
            .arg("%s\n")
            .arg("GIT_PRIVATE_TOKEN=a token with spaces")
            .arg("it's")
            .arg("$(echo pwned)")
            .arg("")
            .arg("/actions/a@v2,b");
        let result = run(&sh(&inner.render()), &unchecked(), &TextMarker::default()).await.unwrap();
        assert!(result.success());
        let printed: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(printed, inner.argv()[1..].iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn sink_receives_masked_lines_unless_silent() {
        let sink = Arc::new(Collect::default());
        let mut spec = CommandSpec::new("/bin/sh", QuoteStyle::Posix);
        spec.arg("-c")
            .arg("echo \"out $1\"; echo err >&2")
            .arg("sh")
            .arg(Arg::secret("hunter2"));
        let opts = ExecOptions { silent: false, sink: Some(sink.clone()), ..unchecked() };
        run(&spec, &opts, &TextMarker::default()).await.unwrap();

        let mut seen = sink.0.lock().unwrap().clone();
        seen.sort_by_key(|(stream, _)| *stream == Stream::Stderr);
        assert_eq!(
            seen,
            vec![(Stream::Stdout, "out ***".to_string()), (Stream::Stderr, "err".to_string())]
        );

        let silent_sink = Arc::new(Collect::default());
        let opts = ExecOptions { sink: Some(silent_sink.clone()), ..unchecked() };
        run(&spec, &opts, &TextMarker::default()).await.unwrap();
        assert!(silent_sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn multi_line_secret_never_shows() {
        let sink = Arc::new(Collect::default());
        let mut spec = CommandSpec::new("/bin/sh", QuoteStyle::Posix);
        spec.arg("-c")
            .arg("printf '%s\\n' \"$1\"")
            .arg("sh")
            .arg(Arg::secret("first-half\nsecond-half"));
        let opts = ExecOptions { silent: false, sink: Some(sink.clone()), ..unchecked() };
        let result = run(&spec, &opts, &TextMarker::default()).await.unwrap();

        assert_eq!(result.stdout, "***\n");
        for (_, line) in sink.0.lock().unwrap().iter() {
            assert_eq!(line, "***");
        }
    }

    #[tokio::test]
    async fn only_the_tail_of_stderr_is_kept() {
        let opts = ExecOptions { stderr_tail: 2, ..quiet() };
        let result = run(&sh("for i in 1 2 3 4 5; do echo $i >&2; done; exit 1"), &opts, &TextMarker::default())
            .await
            .unwrap();
        assert_eq!(result.stderr, "4\n5\n");
        let err = result.into_result().unwrap_err();
        assert!(err.to_string().ends_with("4\n5"));
    }

    #[tokio::test]
    async fn stdout_fallback_is_tailed_too() {
        let opts = ExecOptions { stderr_tail: 1, ..quiet() };
        let err = execute(&sh("echo one; echo two; exit 4"), &opts, &TextMarker::default()).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.ends_with("\ntwo"));
        assert!(!msg.contains("\none"));
    }

    #[test]
    fn last_lines_counts_from_the_end() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("a\nb", 5), "a\nb");
        assert_eq!(last_lines("a\nb", 0), "");
    }
}
