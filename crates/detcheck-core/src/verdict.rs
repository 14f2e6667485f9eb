//! Determinism verdicts over artifact digests.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Exit status for a deterministic session.
pub const EXIT_DETERMINISTIC: i32 = 0;

/// Exit status for a non-deterministic session.
pub const EXIT_NON_DETERMINISTIC: i32 = 1;

/// Content digest reported by the checksum tool for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDigest {
    pub path: PathBuf,
    pub digest: String,
}

/// Extract the comparison key from checksum output: its first
/// whitespace-delimited token.
pub fn digest_token(stdout: &str) -> Option<&str> {
    stdout.split_whitespace().next()
}

/// Outcome of comparing the digests of every artifact in a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Every artifact has the same digest.
    Deterministic { digest: String, artifacts: usize },
    /// Artifacts grouped by digest; more than one group.
    NonDeterministic {
        groups: BTreeMap<String, Vec<PathBuf>>,
    },
}

impl Verdict {
    /// Reduce digests to a verdict. Returns `None` when there are no digests.
    pub fn from_digests(digests: &[ArtifactDigest]) -> Option<Self> {
        let mut groups: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for d in digests {
            groups.entry(d.digest.clone()).or_default().push(d.path.clone());
        }

        match groups.len() {
            0 => None,
            1 => groups.into_iter().next().map(|(digest, paths)| Self::Deterministic {
                digest,
                artifacts: paths.len(),
            }),
            _ => Some(Self::NonDeterministic { groups }),
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self, Self::Deterministic { .. })
    }

    /// Number of distinct digests.
    pub fn distinct(&self) -> usize {
        match self {
            Self::Deterministic { .. } => 1,
            Self::NonDeterministic { groups } => groups.len(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_deterministic() {
            EXIT_DETERMINISTIC
        } else {
            EXIT_NON_DETERMINISTIC
        }
    }
}
