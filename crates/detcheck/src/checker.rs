//! Determinism checking via an external checksum tool.
//!
//! The first whitespace-delimited token of the tool's stdout is the comparison
//! key; no particular hash algorithm is assumed.

use crate::runner::{Invocation, ProcessRunner, RunnerError};
use detcheck_core::verdict::digest_token;
use detcheck_core::{ArtifactDigest, Verdict};
use futures::future::join_all;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum CheckerError {
    #[error("checksum failed for {}: {}", .path.display(), .source)]
    Checksum {
        path: PathBuf,
        #[source]
        source: RunnerError,
    },
    #[error("checksum of {} produced no output", .0.display())]
    EmptyDigest(PathBuf),
    #[error("archive path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
    #[error("no archives to compare")]
    NoArtifacts,
}

pub type Result<T> = std::result::Result<T, CheckerError>;

/// Hash every artifact concurrently with `checksum_command <path>`.
///
/// All checksums are awaited; the first failure in path order is returned.
pub async fn hash_artifacts(
    runner: &ProcessRunner,
    checksum_command: &[String],
    artifacts: &[PathBuf],
) -> Result<Vec<ArtifactDigest>> {
    let invocations = artifacts
        .iter()
        .map(|path| {
            let arg = path
                .to_str()
                .ok_or_else(|| CheckerError::NonUtf8Path(path.clone()))?;
            Ok(Invocation::new(checksum_command.iter().cloned())
                .arg(arg)
                .check(true))
        })
        .collect::<Result<Vec<_>>>()?;

    let results = join_all(invocations.iter().map(|inv| runner.run(inv))).await;

    artifacts
        .iter()
        .zip(results)
        .map(|(path, result)| {
            let result = result.map_err(|source| CheckerError::Checksum {
                path: path.clone(),
                source,
            })?;
            let digest = digest_token(&result.stdout)
                .ok_or_else(|| CheckerError::EmptyDigest(path.clone()))?;
            debug!(artifact = %path.display(), digest, "hashed archive");
            Ok(ArtifactDigest {
                path: path.clone(),
                digest: digest.to_string(),
            })
        })
        .collect()
}

/// Reduce digests to a verdict and log it.
pub fn compare(digests: &[ArtifactDigest]) -> Result<Verdict> {
    let verdict = Verdict::from_digests(digests).ok_or(CheckerError::NoArtifacts)?;

    match &verdict {
        Verdict::Deterministic { digest, artifacts } => {
            info!(digest = %digest, archives = artifacts, "all archives identical");
        }
        Verdict::NonDeterministic { groups } => {
            error!(
                "Non-deterministic compilation: {} different archives",
                groups.len()
            );
            for (digest, paths) in groups {
                let names: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
                info!(digest = %digest, archives = %names.join(", "), "archive group");
            }
        }
    }

    Ok(verdict)
}
