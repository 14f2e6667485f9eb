//! End-to-end tests for determinism sessions.
//!
//! Each test drives a `Session` with an `sh` script standing in for the
//! compiler. The script reads its archive path from `POPLAR_ENGINE_OPTIONS`
//! and the archives are hashed with the system `cksum`.

use detcheck::orchestrator::OrchestratorError;
use detcheck::runner::{ProcessRunner, RunnerConfig, RunnerError};
use detcheck::{
    Session, SessionError, EXIT_COMMAND_FAILED, EXIT_CONFLICT, EXIT_LAUNCH,
    EXIT_MISSING_ARTIFACTS,
};
use detcheck_core::config::ENGINE_OPTIONS_VAR;
use detcheck_core::{ComposeError, Environment, SessionConfig, Verdict};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// Shell snippet setting `$out` to the injected archive path.
const READ_OUT: &str = r#"out=$(printf '%s' "$POPLAR_ENGINE_OPTIONS" | sed -n 's/.*"target\.saveArchive":"\([^"]*\)".*/\1/p')"#;

fn sh_command(body: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("{READ_OUT}; {body}"),
    ]
}

fn base_env() -> Environment {
    std::env::vars_os()
        .filter(|(k, _)| k != ENGINE_OPTIONS_VAR)
        .collect()
}

fn config(dir: &Path, repeats: usize, overwrite: bool, body: &str) -> SessionConfig {
    SessionConfig {
        output_dir: Some(dir.to_path_buf()),
        repeats,
        overwrite,
        command: sh_command(body),
        ..Default::default()
    }
}

async fn run(config: SessionConfig, env: Environment) -> Result<detcheck::SessionReport, SessionError> {
    Session::new(config, env).unwrap().run().await
}

#[tokio::test]
async fn identical_archives_are_deterministic() {
    let dir = TempDir::new().unwrap();
    let report = run(
        config(dir.path(), 3, true, r#"printf 'fixed archive' > "$out""#),
        base_env(),
    )
    .await
    .unwrap();

    assert_eq!(report.dispatched, 3);
    assert_eq!(report.artifacts.len(), 3);
    assert!(report.artifacts.iter().all(|p| p.exists()));
    assert!(matches!(
        report.verdict,
        Verdict::Deterministic { artifacts: 3, .. }
    ));
    assert_eq!(report.exit_code(), 0);
    assert!(!report.temporary);
}

#[tokio::test]
async fn differing_archives_are_non_deterministic() {
    let dir = TempDir::new().unwrap();
    // Each run writes its own path, so every archive differs.
    let report = run(
        config(dir.path(), 3, true, r#"printf '%s' "$out" > "$out""#),
        base_env(),
    )
    .await
    .unwrap();

    assert_eq!(report.verdict.distinct(), 3);
    assert_eq!(report.exit_code(), 1);
}

/// Counts ERROR events seen on the current thread.
struct ErrorCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn non_deterministic_verdict_is_logged_once_at_error() {
    let errors = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(ErrorCounter(errors.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = TempDir::new().unwrap();
    let report = run(
        config(dir.path(), 2, true, r#"printf '%s' "$out" > "$out""#),
        base_env(),
    )
    .await
    .unwrap();

    assert_eq!(report.exit_code(), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn custom_runner_bounds_failure_output() {
    let dir = TempDir::new().unwrap();
    let session = Session::new(
        config(dir.path(), 2, true, "echo 'a very long linker diagnostic' >&2; exit 3"),
        base_env(),
    )
    .unwrap()
    .with_runner(ProcessRunner::new(RunnerConfig {
        max_output_bytes: 4,
    }));
    assert_eq!(session.config().repeats, 2);
    assert!(session.config().overwrite);

    let err = session.run().await.unwrap_err();
    match &err {
        SessionError::Orchestrator(OrchestratorError::RunsFailed {
            source: RunnerError::CommandFailed(failure),
            ..
        }) => {
            assert_eq!(failure.exit_code, 3);
            assert!(failure.stderr.len() <= 4);
            assert!("a very long linker diagnostic".starts_with(&failure.stderr));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), EXIT_COMMAND_FAILED);
}

#[tokio::test]
async fn existing_archives_are_reused() {
    let dir = TempDir::new().unwrap();
    for i in 0..2 {
        std::fs::write(dir.path().join(format!("archive{i}.a")), b"prebuilt").unwrap();
    }

    // Would fail if it ran at all.
    let report = run(config(dir.path(), 2, false, "exit 1"), base_env())
        .await
        .unwrap();

    assert_eq!(report.dispatched, 0);
    assert_eq!(report.exit_code(), 0);
    for path in &report.artifacts {
        assert_eq!(std::fs::read(path).unwrap(), b"prebuilt");
    }
}

#[tokio::test]
async fn only_missing_archives_are_generated() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("archive0.a"), b"fixed archive").unwrap();

    let report = run(
        config(dir.path(), 3, false, r#"printf 'fixed archive' > "$out""#),
        base_env(),
    )
    .await
    .unwrap();

    assert_eq!(report.dispatched, 2);
    assert!(report.verdict.is_deterministic());
}

#[tokio::test]
async fn overwrite_regenerates_existing_archives() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("archive0.a"), b"stale").unwrap();

    let report = run(
        config(dir.path(), 2, true, r#"printf 'fresh' > "$out""#),
        base_env(),
    )
    .await
    .unwrap();

    assert_eq!(report.dispatched, 2);
    assert_eq!(std::fs::read(dir.path().join("archive0.a")).unwrap(), b"fresh");
    assert!(report.verdict.is_deterministic());
}

#[tokio::test]
async fn conflicting_options_abort_before_any_run() {
    let dir = TempDir::new().unwrap();
    let marker = dir.path().join("ran");
    let env = base_env().with_var(ENGINE_OPTIONS_VAR, r#"{"target.saveArchive":"mine.a"}"#);
    let body = format!(r#"touch "{}"; printf x > "$out""#, marker.display());

    let err = run(config(dir.path(), 3, true, &body), env).await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::Orchestrator(OrchestratorError::Compose(
            ComposeError::ConflictingConfiguration { .. }
        ))
    ));
    assert_eq!(err.exit_code(), EXIT_CONFLICT);
    assert!(!marker.exists());
}

#[tokio::test]
async fn user_options_are_passed_through() {
    let dir = TempDir::new().unwrap();
    let env = base_env().with_var(ENGINE_OPTIONS_VAR, r#"{"debug.verify":"true"}"#);
    // The archive content is the full options string, minus the per-run path.
    let body = r#"printf '%s' "$POPLAR_ENGINE_OPTIONS" | sed 's/"target\.saveArchive":"[^"]*"//' > "$out""#;

    let report = run(config(dir.path(), 2, true, body), env).await.unwrap();
    assert!(report.verdict.is_deterministic());

    let content = std::fs::read_to_string(&report.artifacts[0]).unwrap();
    assert!(content.contains(r#""debug.verify":"true""#));
}

#[tokio::test]
async fn successful_run_without_archive_is_missing() {
    let dir = TempDir::new().unwrap();
    let err = run(config(dir.path(), 2, true, "true"), base_env())
        .await
        .unwrap_err();

    match &err {
        SessionError::Orchestrator(OrchestratorError::MissingArtifacts { missing, total }) => {
            assert_eq!(*total, 2);
            assert_eq!(missing.len(), 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), EXIT_MISSING_ARTIFACTS);
}

#[tokio::test]
async fn failing_command_surfaces_output() {
    let dir = TempDir::new().unwrap();
    let err = run(
        config(dir.path(), 2, true, "echo 'linker exploded' >&2; exit 4"),
        base_env(),
    )
    .await
    .unwrap_err();

    match &err {
        SessionError::Orchestrator(OrchestratorError::RunsFailed {
            failed,
            source: RunnerError::CommandFailed(failure),
            ..
        }) => {
            assert_eq!(*failed, 2);
            assert_eq!(failure.exit_code, 4);
            assert_eq!(failure.stderr, "linker exploded");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.exit_code(), EXIT_COMMAND_FAILED);
    assert!(err.to_string().contains("linker exploded"));
}

#[tokio::test]
async fn missing_binary_is_launch_failure() {
    let dir = TempDir::new().unwrap();
    let config = SessionConfig {
        output_dir: Some(dir.path().to_path_buf()),
        command: vec!["detcheck-no-such-compiler".to_string()],
        overwrite: true,
        ..Default::default()
    };

    let err = run(config, base_env()).await.unwrap_err();
    assert_eq!(err.exit_code(), EXIT_LAUNCH);
}

#[tokio::test]
async fn temporary_output_directory_is_removed() {
    let config = SessionConfig {
        output_dir: None,
        repeats: 2,
        command: sh_command(r#"printf 'fixed' > "$out""#),
        ..Default::default()
    };

    let report = run(config, base_env()).await.unwrap();
    assert!(report.temporary);
    assert!(report.verdict.is_deterministic());
    assert!(!report.output_dir.exists());
}

#[tokio::test]
async fn output_directory_is_created() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("nested/archives");

    let report = run(
        config(&nested, 2, false, r#"printf 'fixed' > "$out""#),
        base_env(),
    )
    .await
    .unwrap();
    assert!(nested.is_dir());
    assert_eq!(report.exit_code(), 0);
}
