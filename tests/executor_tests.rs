//! Sandbox executor tests, exercised in restricted mode with `sh` as the
//! interpreter so they run without docker or a python install.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use campus_grid::config::{LimitsConfig, SandboxConfig};
use campus_grid::protocol::JobOutcome;
use campus_grid::worker::sandbox::{JobAssignment, SandboxExecutor};

fn assignment(code: &str, timeout: u32) -> JobAssignment {
    JobAssignment {
        job_id: "test-job".to_string(),
        code: code.to_string(),
        requirements: None,
        cpu_cores: 1,
        ram_gb: 1.0,
        timeout_seconds: timeout,
    }
}

fn shell_executor(limits: LimitsConfig) -> SandboxExecutor {
    let config = SandboxConfig {
        enabled: false,
        fallback_command: "sh".to_string(),
        ..SandboxConfig::default()
    };
    SandboxExecutor::new(config, limits, false)
}

#[tokio::test]
async fn restricted_run_captures_stdout() {
    let executor = shell_executor(LimitsConfig::default());
    let result = executor.execute(&assignment("echo hello", 30)).await;

    assert_eq!(result.outcome, JobOutcome::Completed);
    assert_eq!(result.stdout, "hello\n");
    assert!(!result.sandboxed);
}

#[tokio::test]
async fn restricted_run_reports_failure_with_exit_status() {
    let executor = shell_executor(LimitsConfig::default());
    let result = executor.execute(&assignment("exit 3", 30)).await;

    assert_eq!(result.outcome, JobOutcome::Failed);
    assert_eq!(result.reason.as_deref(), Some("exit status 3"));
}

#[tokio::test]
async fn restricted_run_is_killed_at_timeout() {
    let executor = shell_executor(LimitsConfig::default());
    let started = std::time::Instant::now();
    let result = executor.execute(&assignment("sleep 30", 1)).await;

    assert_eq!(result.outcome, JobOutcome::TimedOut);
    assert_eq!(result.reason.as_deref(), Some("timeout"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn stderr_is_captured_separately() {
    let executor = shell_executor(LimitsConfig::default());
    let result = executor
        .execute(&assignment("echo out; echo err 1>&2", 30))
        .await;

    assert_eq!(result.outcome, JobOutcome::Completed);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
}

#[tokio::test]
async fn output_files_are_collected_and_encoded() {
    let executor = shell_executor(LimitsConfig::default());
    let result = executor
        .execute(&assignment(r#"printf data > "$OUTPUT_DIR/result.txt""#, 30))
        .await;

    assert_eq!(result.outcome, JobOutcome::Completed);
    assert_eq!(result.files.len(), 1);
    assert_eq!(result.files[0].name, "result.txt");
    assert_eq!(result.files[0].bytes_b64, BASE64.encode(b"data"));
}

#[tokio::test]
async fn scratch_files_are_not_collected() {
    let executor = shell_executor(LimitsConfig::default());
    // Files written to the working directory are scratch, not output.
    let result = executor
        .execute(&assignment("printf x > scratch-note.txt", 30))
        .await;

    assert_eq!(result.outcome, JobOutcome::Completed);
    assert!(result.files.is_empty());
}

#[tokio::test]
async fn oversized_artifacts_are_dropped_with_notice() {
    let limits = LimitsConfig {
        max_artifact_bytes: 8,
        ..LimitsConfig::default()
    };
    let executor = shell_executor(limits);

    let result = executor
        .execute(&assignment(
            r#"printf 0123456789abcdef > "$OUTPUT_DIR/big.bin""#,
            30,
        ))
        .await;

    assert_eq!(result.outcome, JobOutcome::Completed);
    assert!(result.files.is_empty());
    assert!(result.stderr.contains("artifact dropped"));
}

#[tokio::test]
async fn long_stdout_is_truncated() {
    let limits = LimitsConfig {
        max_output_bytes: 64,
        ..LimitsConfig::default()
    };
    let executor = shell_executor(limits);

    let result = executor
        .execute(&assignment(
            "i=0; while [ $i -lt 100 ]; do echo line $i; i=$((i+1)); done",
            30,
        ))
        .await;

    assert_eq!(result.outcome, JobOutcome::Completed);
    assert!(result.stdout.len() < 100);
    assert!(result.stdout.ends_with("[output truncated]"));
}

#[tokio::test]
async fn job_timeout_is_capped_by_the_configured_maximum() {
    let limits = LimitsConfig {
        max_timeout_seconds: 1,
        ..LimitsConfig::default()
    };
    let executor = shell_executor(limits);

    let started = std::time::Instant::now();
    // The job asks for far more than the worker allows.
    let result = executor.execute(&assignment("sleep 30", 3600)).await;

    assert_eq!(result.outcome, JobOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(10));
}
