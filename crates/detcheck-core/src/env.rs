//! Environment snapshots and engine option injection.
//!
//! Each run gets its own `Environment`, derived from a shared base plus one
//! rewritten JSON variable. The base is never mutated and the process-wide
//! environment table is never touched.

use crate::config::{ENGINE_OPTIONS_VAR, SAVE_ARCHIVE_KEY};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("{var} already contains '{key}' (set to {existing})")]
    ConflictingConfiguration {
        var: String,
        key: String,
        existing: Value,
    },
    #[error("{var} is not valid JSON: {source}")]
    InvalidConfiguration {
        var: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{var} must be a JSON object, found {found}")]
    NotAnObject { var: String, found: &'static str },
    #[error("{var} is not valid unicode")]
    NotUnicode { var: String },
    #[error("artifact path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),
}

pub type Result<T> = std::result::Result<T, ComposeError>;

/// Immutable mapping of environment variable names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<OsString, OsString>,
}

impl Environment {
    /// Snapshot the current process environment.
    pub fn from_process() -> Self {
        std::env::vars_os().collect()
    }

    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.vars.get(key.as_ref()).map(OsString::as_os_str)
    }

    /// Return a copy of this environment with one variable set.
    pub fn with_var(&self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        let mut vars = self.vars.clone();
        vars.insert(key.into(), value.into());
        Self { vars }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Environment
where
    K: Into<OsString>,
    V: Into<OsString>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Which environment variable carries the engine options, and which key in it
/// receives the artifact path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionsInjector {
    pub var: String,
    pub key: String,
}

impl Default for OptionsInjector {
    fn default() -> Self {
        Self {
            var: ENGINE_OPTIONS_VAR.to_string(),
            key: SAVE_ARCHIVE_KEY.to_string(),
        }
    }
}

impl OptionsInjector {
    pub fn new(var: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            key: key.into(),
        }
    }

    /// Parse the options held by `base` and check that the injection key is free.
    ///
    /// An absent variable is treated as `{}`.
    pub fn prepare<'a>(&'a self, base: &'a Environment) -> Result<Composer<'a>> {
        let options = match base.get(&self.var) {
            None => Map::new(),
            Some(raw) => {
                let raw = raw.to_str().ok_or_else(|| ComposeError::NotUnicode {
                    var: self.var.clone(),
                })?;
                parse_options(&self.var, raw)?
            }
        };

        if let Some(existing) = options.get(&self.key) {
            return Err(ComposeError::ConflictingConfiguration {
                var: self.var.clone(),
                key: self.key.clone(),
                existing: existing.clone(),
            });
        }

        Ok(Composer {
            injector: self,
            base,
            options,
        })
    }
}

fn parse_options(var: &str, raw: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|source| ComposeError::InvalidConfiguration {
            var: var.to_string(),
            source,
        })?;

    match value {
        Value::Object(map) => Ok(map),
        other => Err(ComposeError::NotAnObject {
            var: var.to_string(),
            found: json_kind(&other),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Validated base options, ready to produce one snapshot per artifact path.
#[derive(Debug)]
pub struct Composer<'a> {
    injector: &'a OptionsInjector,
    base: &'a Environment,
    options: Map<String, Value>,
}

impl Composer<'_> {
    /// Build the environment for a run writing to `target`.
    pub fn compose(&self, target: &Path) -> Result<Environment> {
        let target = target
            .to_str()
            .ok_or_else(|| ComposeError::NonUtf8Path(target.to_path_buf()))?;

        let mut options = self.options.clone();
        options.insert(self.injector.key.clone(), Value::String(target.to_string()));
        let encoded = Value::Object(options).to_string();

        Ok(self.base.with_var(&self.injector.var, encoded))
    }
}

/// One-shot composition of a single snapshot.
pub fn compose(base: &Environment, injector: &OptionsInjector, target: &Path) -> Result<Environment> {
    injector.prepare(base)?.compose(target)
}
