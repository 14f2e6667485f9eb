//! Runner module for executing external commands.
//!
//! Key responsibilities:
//! - Spawn a command with an explicit environment snapshot
//! - Feed an optional stdin payload
//! - Capture stdout/stderr with a size bound
//! - Distinguish launch failures from non-zero exits

use chrono::Utc;
use detcheck_core::Environment;
use std::fmt;
use std::io::ErrorKind;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

/// Maximum bytes to capture from each of stdout/stderr.
///
/// Build tools can be chatty; anything past this is drained and discarded.
const MAX_OUTPUT_BYTES: usize = 50 * 1024 * 1024;

/// Longest stdout preview included in debug logs.
const LOG_PREVIEW_CHARS: usize = 200;

/// Read from an async reader with a maximum byte limit.
///
/// Returns the buffer truncated at `max_bytes` and whether anything was
/// dropped. Logs a warning once if truncated. Reading continues to EOF so the
/// child never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(
    mut reader: R,
    max_bytes: usize,
) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::with_capacity(8192.min(max_bytes));
    let mut chunk = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        let to_take = n.min(max_bytes.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..to_take]);

        if to_take < n && !truncated {
            warn!(max_bytes, "output exceeded limit, truncating");
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, max_bytes: usize) -> std::io::Result<Vec<u8>> {
    match reader {
        Some(reader) => read_bounded(reader, max_bytes).await.map(|(buf, _)| buf),
        None => Ok(Vec::new()),
    }
}

/// Write `input` to the child's stdin and close it.
///
/// A child that exits without reading its input is not an error.
async fn feed_stdin(stdin: Option<ChildStdin>, input: Option<&[u8]>) -> std::io::Result<()> {
    let (Some(mut stdin), Some(input)) = (stdin, input) else {
        return Ok(());
    };

    let result = async {
        stdin.write_all(input).await?;
        stdin.shutdown().await
    }
    .await;

    match result {
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Truncate a string for logging, adding "..." if truncated.
fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no command to run")]
    EmptyCommand,
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error while running '{command}': {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    CommandFailed(Box<CommandFailure>),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// A command that ran to completion but exited non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    /// Full argument vector, including extra arguments.
    pub args: Vec<String>,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "command '{}' returned non-zero exit status {}",
            self.args.join(" "),
            self.exit_code
        )?;
        if !self.stdout.is_empty() {
            write!(f, "\nstdout: {}", self.stdout)?;
        }
        if !self.stderr.is_empty() {
            write!(f, "\nstderr: {}", self.stderr)?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailure {}

/// Description of one command execution.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    args: Vec<String>,
    extra_args: Vec<String>,
    env: Option<Environment>,
    input: Option<Vec<u8>>,
    check: bool,
}

impl Invocation {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Append an argument after the command vector.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Run with exactly this environment instead of inheriting the parent's.
    pub fn env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Payload written to the child's stdin.
    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Fail with `CommandFailed` on a non-zero exit.
    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Command vector followed by extra arguments.
    pub fn full_args(&self) -> Vec<String> {
        self.args.iter().chain(&self.extra_args).cloned().collect()
    }

    fn display(&self) -> String {
        self.full_args().join(" ")
    }
}

/// Result of executing a command.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub args: Vec<String>,
    /// Exit code, or -1 if the process was terminated by a signal.
    pub exit_code: i32,
    /// Stdout, decoded lossily and trimmed.
    pub stdout: String,
    /// Stderr, decoded lossily and trimmed.
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Capture limit per output stream.
    pub max_output_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: MAX_OUTPUT_BYTES,
        }
    }
}

/// Runner for external commands. Invocations are independent and may be
/// awaited concurrently.
#[derive(Debug, Default)]
pub struct ProcessRunner {
    config: RunnerConfig,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RunnerConfig::default())
    }

    pub async fn run(&self, invocation: &Invocation) -> Result<ExecutionResult> {
        let (program, rest) = invocation
            .args
            .split_first()
            .ok_or(RunnerError::EmptyCommand)?;
        let command_str = invocation.display();

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .args(&invocation.extra_args)
            .stdin(if invocation.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = &invocation.env {
            cmd.env_clear().envs(env.iter());
        }

        debug!(command = %command_str, "spawning process");

        let start = Utc::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Launch {
            program: program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let max_bytes = self.config.max_output_bytes;

        let (fed, stdout, stderr, status) = tokio::join!(
            feed_stdin(stdin, invocation.input.as_deref()),
            capture(stdout, max_bytes),
            capture(stderr, max_bytes),
            child.wait(),
        );

        let io_error = |source: std::io::Error| RunnerError::Io {
            command: command_str.clone(),
            source,
        };
        fed.map_err(io_error)?;
        let stdout = decode(&stdout.map_err(io_error)?);
        let stderr = decode(&stderr.map_err(io_error)?);
        let exit_code = status.map_err(io_error)?.code().unwrap_or(-1);

        let duration_ms = (Utc::now() - start).num_milliseconds() as u64;

        debug!(
            command = %command_str,
            exit_code,
            duration_ms,
            stdout = %truncate_str(&stdout, LOG_PREVIEW_CHARS),
            "process finished"
        );

        let result = ExecutionResult {
            args: invocation.full_args(),
            exit_code,
            stdout,
            stderr,
            duration_ms,
        };

        if invocation.check && !result.success() {
            return Err(RunnerError::CommandFailed(Box::new(CommandFailure {
                args: result.args,
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            })));
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Invocation {
        Invocation::new(["sh", "-c", script])
    }

    fn path_only_env() -> Environment {
        std::env::vars_os()
            .filter(|(k, _)| k == "PATH")
            .collect()
    }

    #[tokio::test]
    async fn captures_trimmed_stdout_and_stderr() {
        let runner = ProcessRunner::with_defaults();
        let result = runner
            .run(&sh("echo '  hello  '; echo oops >&2"))
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "hello");
        assert_eq!(result.stderr, "oops");
        assert_eq!(result.args, vec!["sh", "-c", "echo '  hello  '; echo oops >&2"]);
    }

    #[tokio::test]
    async fn extra_args_follow_command() {
        let runner = ProcessRunner::with_defaults();
        let result = runner
            .run(&Invocation::new(["echo", "a"]).arg("b").arg("c"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "a b c");
        assert_eq!(result.args, vec!["echo", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn env_snapshot_replaces_parent_environment() {
        let runner = ProcessRunner::with_defaults();
        let env = path_only_env().with_var("DETCHECK_PROBE", "from-snapshot");

        let result = runner
            .run(&sh("printf '%s|%s' \"$DETCHECK_PROBE\" \"${HOME:-unset}\"").env(env))
            .await
            .unwrap();
        assert_eq!(result.stdout, "from-snapshot|unset");
    }

    #[tokio::test]
    async fn stdin_payload_is_delivered() {
        let runner = ProcessRunner::with_defaults();
        let result = runner
            .run(&Invocation::new(["cat"]).input("piped input"))
            .await
            .unwrap();
        assert_eq!(result.stdout, "piped input");
    }

    #[tokio::test]
    async fn unread_stdin_is_not_an_error() {
        let runner = ProcessRunner::with_defaults();
        let payload = vec![b'x'; 1024 * 1024];
        let result = runner
            .run(&Invocation::new(["true"]).input(payload))
            .await
            .unwrap();
        assert!(result.success());
    }

    #[tokio::test]
    async fn nonzero_exit_without_check_is_ok() {
        let runner = ProcessRunner::with_defaults();
        let result = runner.run(&sh("exit 3")).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn nonzero_exit_with_check_fails() {
        let runner = ProcessRunner::with_defaults();
        let err = runner
            .run(&sh("echo partial; echo broken >&2; exit 7").check(true))
            .await
            .unwrap_err();

        let failure = match err {
            RunnerError::CommandFailed(failure) => failure,
            other => panic!("expected CommandFailed, got {other}"),
        };
        assert_eq!(failure.exit_code, 7);
        assert_eq!(failure.stdout, "partial");
        assert_eq!(failure.stderr, "broken");

        let message = failure.to_string();
        assert!(message.contains("returned non-zero exit status 7"));
        assert!(message.contains("stdout: partial"));
        assert!(message.contains("stderr: broken"));
    }

    #[tokio::test]
    async fn signal_termination_reports_negative_one() {
        let runner = ProcessRunner::with_defaults();
        let result = runner.run(&sh("kill -9 $$")).await.unwrap();
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn missing_binary_is_launch_failure() {
        let runner = ProcessRunner::with_defaults();
        let err = runner
            .run(&Invocation::new(["detcheck-no-such-binary-xyz"]).check(true))
            .await
            .unwrap_err();
        match err {
            RunnerError::Launch { program, source } => {
                assert_eq!(program, "detcheck-no-such-binary-xyz");
                assert_eq!(source.kind(), ErrorKind::NotFound);
            }
            other => panic!("expected Launch, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let runner = ProcessRunner::with_defaults();
        let err = runner
            .run(&Invocation::new(Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::EmptyCommand));
    }

    #[tokio::test]
    async fn output_is_bounded() {
        let runner = ProcessRunner::new(RunnerConfig {
            max_output_bytes: 16,
        });
        let result = runner
            .run(&sh("head -c 100000 /dev/zero | tr '\\0' 'a'"))
            .await
            .unwrap();
        assert_eq!(result.stdout.len(), 16);
    }

    #[tokio::test]
    async fn read_bounded_flags_overflow_in_final_chunk() {
        let input: &[u8] = b"0123456789abcdefghij";
        let (buf, truncated) = read_bounded(input, 16).await.unwrap();
        assert_eq!(buf, b"0123456789abcdef");
        assert!(truncated);
    }

    #[tokio::test]
    async fn read_bounded_exact_fit_is_not_truncated() {
        let input: &[u8] = b"0123456789abcdef";
        let (buf, truncated) = read_bounded(input, 16).await.unwrap();
        assert_eq!(buf.len(), 16);
        assert!(!truncated);
    }

    #[test]
    fn truncate_str_is_char_safe() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("ééééééé", 5), "éé...");
    }
}
