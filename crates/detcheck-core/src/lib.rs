pub mod artifacts;
pub mod config;
pub mod env;
pub mod verdict;

pub use artifacts::{ArtifactError, ArtifactSet};
pub use config::{ConfigError, LogLevel, SessionConfig};
pub use env::{ComposeError, Composer, Environment, OptionsInjector};
pub use verdict::{ArtifactDigest, Verdict};
