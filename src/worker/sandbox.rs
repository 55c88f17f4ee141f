//! Sandboxed execution of untrusted job payloads.
//!
//! Container mode runs the payload under `docker run` with network egress
//! disabled, a hard memory cap, a CPU quota, a process-count cap, and only
//! three mounts: the code (read-only), a writable scratch directory, and the
//! output directory that is collected on exit. The wall-clock timeout is
//! enforced here and the kill is forceful.
//!
//! The restricted fallback runs the payload as a plain subprocess with the
//! same timeout and nothing else; results from it are flagged unsandboxed.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::process::Command;

use crate::config::{LimitsConfig, SandboxConfig};
use crate::protocol::{ArtifactFile, JobOutcome};

/// Exit code the install step maps to a `dependency` failure. Picked clear
/// of the codes docker itself uses (125..127) and of SIGKILL's 137.
const DEPENDENCY_EXIT_CODE: i32 = 97;

/// A job as handed to the executor.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub job_id: String,
    pub code: String,
    pub requirements: Option<String>,
    pub cpu_cores: u32,
    pub ram_gb: f64,
    pub timeout_seconds: u32,
}

/// What execution produced, ready to report as a `job_result`.
#[derive(Debug)]
pub struct ExecutionResult {
    pub outcome: JobOutcome,
    pub reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub files: Vec<ArtifactFile>,
    pub sandboxed: bool,
}

impl ExecutionResult {
    fn failed(reason: &str, stderr: String, sandboxed: bool) -> Self {
        Self {
            outcome: JobOutcome::Failed,
            reason: Some(reason.to_string()),
            stdout: String::new(),
            stderr,
            files: Vec::new(),
            sandboxed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    config: SandboxConfig,
    limits: LimitsConfig,
    /// True when docker probing succeeded and the sandbox is enabled.
    container_mode: bool,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig, limits: LimitsConfig, container_mode: bool) -> Self {
        if container_mode {
            tracing::info!(image = %config.image, "Container sandbox enabled");
        } else {
            tracing::warn!("Running in restricted mode, jobs are NOT isolated");
        }
        Self {
            config,
            limits,
            container_mode,
        }
    }

    pub fn container_mode(&self) -> bool {
        self.container_mode
    }

    pub async fn execute(&self, job: &JobAssignment) -> ExecutionResult {
        let timeout = Duration::from_secs(u64::from(
            job.timeout_seconds.min(self.limits.max_timeout_seconds),
        ));
        if self.container_mode {
            self.execute_container(job, timeout).await
        } else {
            self.execute_restricted(job, timeout).await
        }
    }

    async fn execute_container(&self, job: &JobAssignment, timeout: Duration) -> ExecutionResult {
        let dirs = match JobDirs::create(job) {
            Ok(dirs) => dirs,
            Err(e) => return ExecutionResult::failed("setup", e.to_string(), true),
        };

        let run_cmd = if job.requirements.is_some() {
            format!(
                "pip install -q -r /work/requirements.txt || exit {DEPENDENCY_EXIT_CODE}; \
                 python /work/job.py"
            )
        } else {
            "python /work/job.py".to_string()
        };

        let container = format!("campus-job-{}", job.job_id);
        let memory_mb = ((job.ram_gb * 1024.0).ceil() as u64).max(64);

        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&container)
            .arg("--network=none")
            .arg(format!("--memory={memory_mb}m"))
            .arg(format!("--cpus={}", job.cpu_cores.max(1)))
            .arg(format!("--pids-limit={}", self.config.pids_limit))
            .arg("-v")
            .arg(format!("{}:/work:ro", dirs.code.display()))
            .arg("-v")
            .arg(format!("{}:/scratch", dirs.scratch.display()))
            .arg("-v")
            .arg(format!("{}:/output", dirs.output.display()))
            .arg("-w")
            .arg("/scratch")
            .arg("-e")
            .arg("OUTPUT_DIR=/output")
            .arg("-e")
            .arg("PYTHONUNBUFFERED=1")
            .arg(&self.config.image)
            .arg("sh")
            .arg("-c")
            .arg(&run_cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(job_id = %job.job_id, image = %self.config.image, "Starting container");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionResult::failed("setup", e.to_string(), true),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut stderr = self.truncated(&output.stderr);
                let files = self.collect_artifacts(&dirs.output, &mut stderr).await;
                let (outcome, reason) = match output.status.code() {
                    Some(0) => (JobOutcome::Completed, None),
                    Some(DEPENDENCY_EXIT_CODE) => {
                        (JobOutcome::Failed, Some("dependency".to_string()))
                    }
                    // The cgroup OOM killer delivers SIGKILL.
                    Some(137) => (JobOutcome::Failed, Some("oom".to_string())),
                    Some(code) => (JobOutcome::Failed, Some(format!("exit status {code}"))),
                    None => (JobOutcome::Failed, Some("killed".to_string())),
                };
                ExecutionResult {
                    outcome,
                    reason,
                    stdout: self.truncated(&output.stdout),
                    stderr,
                    files,
                    sandboxed: true,
                }
            }
            Ok(Err(e)) => ExecutionResult::failed("setup", e.to_string(), true),
            Err(_) => {
                // Wall clock exceeded: kill the container, not just the
                // docker client.
                let _ = Command::new("docker")
                    .args(["kill", &container])
                    .output()
                    .await;
                tracing::warn!(job_id = %job.job_id, "Job killed at timeout");
                ExecutionResult {
                    outcome: JobOutcome::TimedOut,
                    reason: Some("timeout".to_string()),
                    stdout: String::new(),
                    stderr: format!("job killed after {} seconds", timeout.as_secs()),
                    files: Vec::new(),
                    sandboxed: true,
                }
            }
        }
    }

    async fn execute_restricted(&self, job: &JobAssignment, timeout: Duration) -> ExecutionResult {
        let dirs = match JobDirs::create(job) {
            Ok(dirs) => dirs,
            Err(e) => return ExecutionResult::failed("setup", e.to_string(), false),
        };

        if let Some(requirements) = &job.requirements {
            if let Err(stderr) = self.install_restricted(requirements).await {
                return ExecutionResult::failed("dependency", stderr, false);
            }
        }

        let mut cmd = Command::new(&self.config.fallback_command);
        cmd.arg(dirs.code.join("job.py"))
            .current_dir(&dirs.scratch)
            .env("OUTPUT_DIR", &dirs.output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(job_id = %job.job_id, "Starting restricted subprocess");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return ExecutionResult::failed("setup", e.to_string(), false),
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut stderr = self.truncated(&output.stderr);
                let files = self.collect_artifacts(&dirs.output, &mut stderr).await;
                let (outcome, reason) = if output.status.success() {
                    (JobOutcome::Completed, None)
                } else {
                    (
                        JobOutcome::Failed,
                        Some(match output.status.code() {
                            Some(code) => format!("exit status {code}"),
                            None => "killed".to_string(),
                        }),
                    )
                };
                ExecutionResult {
                    outcome,
                    reason,
                    stdout: self.truncated(&output.stdout),
                    stderr,
                    files,
                    sandboxed: false,
                }
            }
            Ok(Err(e)) => ExecutionResult::failed("setup", e.to_string(), false),
            Err(_) => {
                tracing::warn!(job_id = %job.job_id, "Job killed at timeout");
                ExecutionResult {
                    outcome: JobOutcome::TimedOut,
                    reason: Some("timeout".to_string()),
                    stdout: String::new(),
                    stderr: format!("job killed after {} seconds", timeout.as_secs()),
                    files: Vec::new(),
                    sandboxed: false,
                }
            }
        }
    }

    /// Best-effort dependency install for the fallback mode, one requirement
    /// per line as pip expects.
    async fn install_restricted(&self, requirements: &str) -> Result<(), String> {
        let output = Command::new(&self.config.fallback_command)
            .args(["-m", "pip", "install", "-q"])
            .args(requirements.lines().map(str::trim).filter(|l| !l.is_empty()))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).into_owned())
        }
    }

    /// Gather files from the output directory, base64-encoded, dropping
    /// anything past the total size cap with a notice in stderr.
    async fn collect_artifacts(&self, output_dir: &Path, stderr: &mut String) -> Vec<ArtifactFile> {
        let mut entries = match tokio::fs::read_dir(output_dir).await {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut files = Vec::new();
        let mut total = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    stderr.push_str(&format!("\n[artifact dropped: unreadable {name:?}: {e}]"));
                    continue;
                }
            };
            if total + bytes.len() > self.limits.max_artifact_bytes {
                stderr.push_str(&format!("\n[artifact dropped: over size cap {name:?}]"));
                continue;
            }
            total += bytes.len();
            tracing::debug!(file = %name, size = bytes.len(), "Collected artifact");
            files.push(ArtifactFile {
                name,
                bytes_b64: BASE64.encode(&bytes),
            });
        }
        files
    }

    fn truncated(&self, bytes: &[u8]) -> String {
        let s = String::from_utf8_lossy(bytes);
        if s.len() <= self.limits.max_output_bytes {
            return s.into_owned();
        }
        let mut end = self.limits.max_output_bytes;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut out = s[..end].to_string();
        out.push_str("\n[output truncated]");
        out
    }
}

/// Per-job directory layout under a temp root: `code/` (mounted read-only),
/// `scratch/` (the working directory), `output/` (collected on exit). The
/// root is removed on drop.
struct JobDirs {
    _root: tempfile::TempDir,
    code: std::path::PathBuf,
    scratch: std::path::PathBuf,
    output: std::path::PathBuf,
}

impl JobDirs {
    fn create(job: &JobAssignment) -> std::io::Result<Self> {
        let root = tempfile::Builder::new().prefix("campus-job-").tempdir()?;
        let code = root.path().join("code");
        let scratch = root.path().join("scratch");
        let output = root.path().join("output");
        std::fs::create_dir(&code)?;
        std::fs::create_dir(&scratch)?;
        std::fs::create_dir(&output)?;

        std::fs::write(code.join("job.py"), &job.code)?;
        if let Some(requirements) = &job.requirements {
            std::fs::write(code.join("requirements.txt"), requirements)?;
        }

        Ok(Self {
            _root: root,
            code,
            scratch,
            output,
        })
    }
}

