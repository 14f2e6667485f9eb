//! Run orchestration for archive generation.
//!
//! Key responsibilities:
//! - Decide which archives need a run (skip existing unless overwriting)
//! - Compose every run's environment before anything is launched
//! - Dispatch all runs concurrently and wait for every one of them
//! - Check that every expected archive exists afterwards

use crate::runner::{ExecutionResult, Invocation, ProcessRunner, RunnerError};
use crate::SessionPhase;
use detcheck_core::{ArtifactError, ArtifactSet, ComposeError, Environment, OptionsInjector};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Compose(#[from] ComposeError),
    #[error("{failed} of {total} runs failed; first failure: {source}")]
    RunsFailed {
        failed: usize,
        total: usize,
        #[source]
        source: RunnerError,
    },
    #[error("{} of {} compilations produced no archive: {}", .missing.len(), .total, display_paths(.missing))]
    MissingArtifacts { missing: Vec<PathBuf>, total: usize },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// One pending execution of the build command.
#[derive(Debug, Clone)]
pub struct Run {
    /// Archive this run must produce.
    pub artifact: PathBuf,
    /// Environment the command runs with; owned by this run alone.
    pub env: Environment,
}

/// Build a `Run` for every archive that needs generating.
///
/// The base options are validated even when nothing is pending, and every
/// environment is composed before the caller can launch anything.
pub fn plan_runs(
    artifacts: &ArtifactSet,
    overwrite: bool,
    base: &Environment,
    injector: &OptionsInjector,
) -> Result<Vec<Run>> {
    let composer = injector.prepare(base)?;

    let pending = artifacts.pending(overwrite);
    debug!(
        total = artifacts.len(),
        pending = pending.len(),
        overwrite,
        "computed pending archives"
    );

    pending
        .into_iter()
        .map(|artifact| {
            Ok(Run {
                artifact: artifact.to_path_buf(),
                env: composer.compose(artifact)?,
            })
        })
        .collect()
}

/// Run `command` once per `Run`, all concurrently, with `check` enabled.
///
/// Every run is awaited even when a sibling fails; running processes are
/// never killed. The first failure in run order is returned.
pub async fn dispatch(
    runner: &ProcessRunner,
    command: &[String],
    runs: Vec<Run>,
) -> Result<Vec<ExecutionResult>> {
    let total = runs.len();
    info!(count = total, "running {total} commands");

    let (artifacts, invocations): (Vec<PathBuf>, Vec<Invocation>) = runs
        .into_iter()
        .map(|run| {
            let invocation = Invocation::new(command.iter().cloned())
                .env(run.env)
                .check(true);
            (run.artifact, invocation)
        })
        .unzip();

    let pending = join_all(invocations.iter().map(|inv| runner.run(inv)));
    debug!(phase = %SessionPhase::AwaitingCompletion, count = total, "session phase");
    let results = pending.await;

    let mut completed = Vec::with_capacity(total);
    let mut first_failure = None;
    let mut failed = 0;

    for (artifact, result) in artifacts.iter().zip(results) {
        match result {
            Ok(result) => {
                debug!(
                    artifact = %artifact.display(),
                    duration_ms = result.duration_ms,
                    "run finished"
                );
                completed.push(result);
            }
            Err(err) => {
                warn!(artifact = %artifact.display(), error = %err, "run failed");
                failed += 1;
                first_failure.get_or_insert(err);
            }
        }
    }

    match first_failure {
        Some(source) => Err(OrchestratorError::RunsFailed {
            failed,
            total,
            source,
        }),
        None => Ok(completed),
    }
}

/// Check that every archive in the set exists on disk.
pub fn validate(artifacts: &ArtifactSet) -> Result<()> {
    let missing: Vec<PathBuf> = artifacts
        .missing()
        .into_iter()
        .map(Path::to_path_buf)
        .collect();

    if missing.is_empty() {
        debug!(count = artifacts.len(), "all archives present");
        return Ok(());
    }

    Err(OrchestratorError::MissingArtifacts {
        missing,
        total: artifacts.len(),
    })
}
