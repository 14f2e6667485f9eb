//! Session configuration.
//!
//! Defaults match the Poplar engine conventions: archives are requested via the
//! `target.saveArchive` key of `POPLAR_ENGINE_OPTIONS` and hashed with `cksum`.

use crate::env::OptionsInjector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Environment variable holding the JSON engine options.
pub const ENGINE_OPTIONS_VAR: &str = "POPLAR_ENGINE_OPTIONS";

/// Engine option key that receives the archive path.
pub const SAVE_ARCHIVE_KEY: &str = "target.saveArchive";

pub const DEFAULT_REPEATS: usize = 2;
pub const DEFAULT_EXTENSION: &str = "a";
pub const DEFAULT_CHECKSUM_COMMAND: &str = "cksum";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no command given to run")]
    EmptyCommand,
    #[error("checksum command is empty")]
    EmptyChecksumCommand,
    #[error("repeats must be at least 1")]
    ZeroRepeats,
    #[error("invalid log level '{0}', expected: debug, info, warning, error, critical")]
    InvalidLogLevel(String),
}

/// Configuration for one determinism session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Directory to store archives in. A temporary directory is used when unset.
    pub output_dir: Option<PathBuf>,
    /// Number of compilations to run.
    pub repeats: usize,
    /// Regenerate archives that already exist.
    pub overwrite: bool,
    /// Command executed for each run.
    pub command: Vec<String>,
    /// Checksum command; the artifact path is appended as its last argument.
    pub checksum_command: Vec<String>,
    /// File extension for archives (empty for none).
    pub extension: String,
    /// Environment variable carrying the engine options.
    pub options_var: String,
    /// Key within the engine options that receives the archive path.
    pub archive_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            repeats: DEFAULT_REPEATS,
            overwrite: false,
            command: Vec::new(),
            checksum_command: vec![DEFAULT_CHECKSUM_COMMAND.to_string()],
            extension: DEFAULT_EXTENSION.to_string(),
            options_var: ENGINE_OPTIONS_VAR.to_string(),
            archive_key: SAVE_ARCHIVE_KEY.to_string(),
        }
    }
}

impl SessionConfig {
    /// Create a config that runs `command` with all other settings defaulted.
    pub fn for_command<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.checksum_command.is_empty() {
            return Err(ConfigError::EmptyChecksumCommand);
        }
        if self.repeats == 0 {
            return Err(ConfigError::ZeroRepeats);
        }
        Ok(())
    }

    pub fn injector(&self) -> OptionsInjector {
        OptionsInjector::new(&self.options_var, &self.archive_key)
    }
}

/// Diagnostic verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }

    /// Equivalent `tracing` filter directive. `critical` has no tracing
    /// counterpart and maps to `error`.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}
