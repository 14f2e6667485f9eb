//! detcheck - verify that compilation is deterministic
//!
//! Runs a command multiple times and checks that the archive generated by the
//! engine is always the same. Any difference fails the check.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use detcheck::{Session, EXIT_CONFIG};
use detcheck_core::config::{DEFAULT_CHECKSUM_COMMAND, DEFAULT_EXTENSION, DEFAULT_REPEATS};
use detcheck_core::{ConfigError, Environment, LogLevel, SessionConfig};
use std::io::IsTerminal;
use std::path::PathBuf;
use tracing::{debug, error};
use tracing_subscriber::{fmt, EnvFilter};

/// Verify that compilation is deterministic.
#[derive(Parser)]
#[command(name = "detcheck", version)]
#[command(about = "Verify that compilation is deterministic")]
#[command(
    long_about = "Runs a command multiple times and checks that the archive generated by the \
                  engine is always the same. If any difference is found the check fails.\n\n\
                  All detcheck flags must precede the command; everything from the first \
                  positional argument on is passed to the command unchanged."
)]
struct Cli {
    /// Directory to store the archives (default: a temporary directory)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of compilations to run
    #[arg(long, default_value_t = DEFAULT_REPEATS, value_parser = parse_repeats)]
    repeats: usize,

    /// Ignore existing archives
    #[arg(long)]
    overwrite: bool,

    /// Severity of log messages to print: debug, info, warning, error, critical
    #[arg(long, default_value = "info", value_parser = parse_log_level)]
    log_level: LogLevel,

    /// Checksum command; the archive path is appended as its last argument
    #[arg(long, default_value = DEFAULT_CHECKSUM_COMMAND)]
    checksum_cmd: String,

    /// File extension for generated archives
    #[arg(long, default_value = DEFAULT_EXTENSION)]
    extension: String,

    /// Command to run for each compilation (detcheck flags must precede it)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

fn parse_repeats(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err(ConfigError::ZeroRepeats.to_string()),
        Ok(n) => Ok(n),
        Err(_) => Err(format!("invalid repeat count '{s}'")),
    }
}

fn parse_log_level(s: &str) -> Result<LogLevel, String> {
    s.parse().map_err(|e: ConfigError| e.to_string())
}

fn init_tracing(level: LogLevel) {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.filter_directive())),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stdout().is_terminal())
        .with_target(false)
        .without_time()
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level);

    let config = SessionConfig {
        output_dir: cli.output,
        repeats: cli.repeats,
        overwrite: cli.overwrite,
        command: cli.command,
        checksum_command: cli
            .checksum_cmd
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        extension: cli.extension,
        ..Default::default()
    };

    match serde_json::to_string(&config) {
        Ok(json) => debug!(config = %json, log_level = %cli.log_level, "session config"),
        Err(e) => debug!(error = %e, "failed to serialize session config"),
    }

    let session = match Session::new(config, Environment::from_process()) {
        Ok(session) => session,
        Err(e) => {
            error!("{e}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    // Orchestration is single-threaded; concurrency comes from child processes.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    let code = runtime.block_on(async {
        match session.run().await {
            Ok(report) => report.exit_code(),
            Err(e) => {
                error!("{e}");
                e.exit_code()
            }
        }
    });

    std::process::exit(code);
}
