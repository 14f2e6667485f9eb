//! detcheck - compilation determinism checker
//!
//! Runs a build command several times in parallel, each run saving its engine
//! archive to a distinct path, then compares the archives by checksum.

pub mod checker;
pub mod orchestrator;
pub mod runner;

use std::fmt;
use std::path::{Path, PathBuf};

use checker::CheckerError;
use detcheck_core::{ArtifactSet, ConfigError, Environment, SessionConfig, Verdict};
use orchestrator::OrchestratorError;
use runner::{ProcessRunner, RunnerError};
use thiserror::Error;
use tracing::{debug, info};

/// Exit status for invalid configuration or an unusable output directory.
pub const EXIT_CONFIG: i32 = 2;
/// Exit status for conflicting or malformed engine options.
pub const EXIT_CONFLICT: i32 = 3;
/// Exit status when a command could not be launched.
pub const EXIT_LAUNCH: i32 = 4;
/// Exit status when a command exited non-zero.
pub const EXIT_COMMAND_FAILED: i32 = 5;
/// Exit status when a run reported success without producing its archive.
pub const EXIT_MISSING_ARTIFACTS: i32 = 6;
/// Exit status for any other failure.
pub const EXIT_INTERNAL: i32 = 7;

/// States of one verification session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    ComputingPending,
    Dispatching,
    AwaitingCompletion,
    ValidatingArtifacts,
    Hashing,
    Comparing,
    Deterministic,
    NonDeterministic,
    Failed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::ComputingPending => "computing_pending",
            Self::Dispatching => "dispatching",
            Self::AwaitingCompletion => "awaiting_completion",
            Self::ValidatingArtifacts => "validating_artifacts",
            Self::Hashing => "hashing",
            Self::Comparing => "comparing",
            Self::Deterministic => "deterministic",
            Self::NonDeterministic => "non_deterministic",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enter(phase: SessionPhase) {
    debug!(phase = %phase, "session phase");
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to prepare output directory {}: {}", .path.display(), .source)]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Checker(#[from] CheckerError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

fn runner_exit_code(err: &RunnerError) -> i32 {
    match err {
        RunnerError::EmptyCommand => EXIT_CONFIG,
        RunnerError::Launch { .. } => EXIT_LAUNCH,
        RunnerError::CommandFailed(_) => EXIT_COMMAND_FAILED,
        RunnerError::Io { .. } => EXIT_INTERNAL,
    }
}

impl SessionError {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::OutputDir { .. } => EXIT_CONFIG,
            Self::Orchestrator(err) => match err {
                OrchestratorError::Artifact(_) => EXIT_CONFIG,
                OrchestratorError::Compose(_) => EXIT_CONFLICT,
                OrchestratorError::RunsFailed { source, .. } => runner_exit_code(source),
                OrchestratorError::MissingArtifacts { .. } => EXIT_MISSING_ARTIFACTS,
            },
            Self::Checker(err) => match err {
                CheckerError::Checksum { source, .. } => runner_exit_code(source),
                CheckerError::EmptyDigest(_)
                | CheckerError::NonUtf8Path(_)
                | CheckerError::NoArtifacts => EXIT_INTERNAL,
            },
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Directory the archives were written to.
    pub output_dir: PathBuf,
    /// Whether `output_dir` was temporary (and has since been removed).
    pub temporary: bool,
    /// Every archive compared, in run order.
    pub artifacts: Vec<PathBuf>,
    /// Number of build commands actually executed.
    pub dispatched: usize,
    pub verdict: Verdict,
}

impl SessionReport {
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }
}

/// One end-to-end determinism check.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    base_env: Environment,
    runner: ProcessRunner,
}

impl Session {
    /// Create a session. `base_env` is the environment every run is derived
    /// from; it is never modified.
    pub fn new(config: SessionConfig, base_env: Environment) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            base_env,
            runner: ProcessRunner::with_defaults(),
        })
    }

    pub fn with_runner(mut self, runner: ProcessRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Run the session to a verdict.
    ///
    /// A non-deterministic build is an `Ok` report with a non-zero exit code;
    /// `Err` is reserved for runs that could not be compared at all.
    pub async fn run(&self) -> Result<SessionReport> {
        enter(SessionPhase::Init);

        // Keeps a temporary output directory alive for the whole session.
        let mut temp_dir = None;
        let output_dir = match &self.config.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|source| SessionError::OutputDir {
                    path: dir.clone(),
                    source,
                })?;
                dir.clone()
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("detcheck-")
                    .tempdir()
                    .map_err(|source| SessionError::OutputDir {
                        path: std::env::temp_dir(),
                        source,
                    })?;
                debug!(path = %dir.path().display(), "using temporary directory");
                temp_dir.insert(dir).path().to_path_buf()
            }
        };

        let result = self.run_in(&output_dir).await;
        if let Err(err) = &result {
            debug!(phase = %SessionPhase::Failed, error = %err, "session phase");
        }

        result.map(|(artifacts, dispatched, verdict)| SessionReport {
            output_dir,
            temporary: temp_dir.is_some(),
            artifacts,
            dispatched,
            verdict,
        })
    }

    async fn run_in(&self, output_dir: &Path) -> Result<(Vec<PathBuf>, usize, Verdict)> {
        let config = &self.config;
        let artifacts = ArtifactSet::new(output_dir, config.repeats, &config.extension)
            .map_err(OrchestratorError::from)?;

        enter(SessionPhase::ComputingPending);
        let runs = orchestrator::plan_runs(
            &artifacts,
            config.overwrite,
            &self.base_env,
            &config.injector(),
        )?;
        let dispatched = runs.len();
        if dispatched < artifacts.len() {
            info!(
                existing = artifacts.len() - dispatched,
                "reusing existing archives"
            );
        }

        enter(SessionPhase::Dispatching);
        orchestrator::dispatch(&self.runner, &config.command, runs).await?;

        enter(SessionPhase::ValidatingArtifacts);
        orchestrator::validate(&artifacts)?;
        debug!(count = dispatched, "generated archives");

        enter(SessionPhase::Hashing);
        let digests =
            checker::hash_artifacts(&self.runner, &config.checksum_command, artifacts.paths())
                .await?;

        enter(SessionPhase::Comparing);
        let verdict = checker::compare(&digests)?;

        if verdict.is_deterministic() {
            enter(SessionPhase::Deterministic);
            info!("Passed :-)");
        } else {
            enter(SessionPhase::NonDeterministic);
        }

        Ok((artifacts.paths().to_vec(), dispatched, verdict))
    }
}
