use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Coordinator process configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// TCP address workers dial into.
    pub worker_listen_addr: SocketAddr,
    /// HTTP address the dashboard layer calls.
    pub api_listen_addr: SocketAddr,
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Directory where job artifact files are stored, keyed by job id.
    pub artifacts_dir: PathBuf,
    /// Expected interval between worker heartbeats.
    pub heartbeat_interval: Duration,
    /// How long a running job's worker may stay silent before the job is
    /// reaped. Defaults to 2x the heartbeat interval.
    pub stall_grace: Duration,
    /// How often the reaper scans for stalled and overdue jobs.
    pub reaper_interval: Duration,
    /// Capacity of each session's outbound channel; overflow detaches the
    /// worker.
    pub session_send_capacity: usize,
    pub credits: CreditPolicy,
    pub limits: LimitsConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(30);
        Self {
            worker_listen_addr: "0.0.0.0:9999".parse().unwrap(),
            api_listen_addr: "0.0.0.0:5001".parse().unwrap(),
            db_path: PathBuf::from("campus_grid.db"),
            artifacts_dir: PathBuf::from("job_outputs"),
            heartbeat_interval,
            stall_grace: heartbeat_interval * 2,
            reaper_interval: Duration::from_secs(30),
            session_send_capacity: 32,
            credits: CreditPolicy::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// A session is detached once no frame has arrived for this long.
    pub fn session_read_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Credit accounting policy.
#[derive(Debug, Clone)]
pub struct CreditPolicy {
    /// Balance granted to a new user (`signup_grant` ledger row).
    pub starting_balance: i64,
    /// Refund the submitter when a job fails on the worker. Off by default:
    /// the cost paid for an execution attempt.
    pub refund_on_failure: bool,
    /// Percentage of the cost refunded when a job times out, rounded down.
    pub timeout_refund_percent: u8,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            starting_balance: 100,
            refund_on_failure: false,
            timeout_refund_percent: 50,
        }
    }
}

/// Size and duration bounds protecting the coordinator and workers.
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    /// Maximum body size of a single protocol frame.
    pub max_frame_bytes: usize,
    /// Longest timeout a job may request, in seconds.
    pub max_timeout_seconds: u32,
    /// Cap applied to captured stdout and stderr, each.
    pub max_output_bytes: usize,
    /// Total cap across a job's artifact files.
    pub max_artifact_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 16 * 1024 * 1024,
            max_timeout_seconds: 3600,
            max_output_bytes: 1024 * 1024,
            max_artifact_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Coordinator address, host:port.
    pub manager_addr: String,
    /// Friendly name reported at registration.
    pub name: String,
    /// Owner credential; empty means anonymous (no credits earned).
    pub owner_token: Option<String>,
    pub heartbeat_interval: Duration,
    /// Delay before asking again after `no_job`.
    pub poll_interval: Duration,
    pub sandbox: SandboxConfig,
    pub limits: LimitsConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            manager_addr: "localhost:9999".to_string(),
            name: format!("worker-{}", std::process::id()),
            owner_token: None,
            heartbeat_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            sandbox: SandboxConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Sandbox executor configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Run jobs in containers. When false the executor falls back to the
    /// restricted subprocess mode, which is less safe and flagged as such in
    /// every result.
    pub enabled: bool,
    /// Container image jobs run in.
    pub image: String,
    /// Interpreter used by the restricted fallback mode.
    pub fallback_command: String,
    /// Process-count cap inside the container.
    pub pids_limit: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: "python:3.11-slim".to_string(),
            fallback_command: "python3".to_string(),
            pids_limit: 256,
        }
    }
}
