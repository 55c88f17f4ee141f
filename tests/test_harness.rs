//! Test harness for coordinator integration tests.
//!
//! Boots a real coordinator (temp-dir SQLite, ephemeral ports) and provides
//! a scripted worker that speaks the actual wire protocol over TCP.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use campus_grid::config::CoordinatorConfig;
use campus_grid::coordinator::Coordinator;
use campus_grid::protocol::{
    read_message, write_message, ArtifactFile, CoordinatorMessage, JobDemands, JobOutcome,
    ReportedStatus, WorkerMessage, WorkerSpecs,
};
use campus_grid::registry::WorkerRegistry;
use campus_grid::scheduler::matcher::job_cost;
use campus_grid::scheduler::Scheduler;
use campus_grid::store::{JobRow, NewJob, Role, Store, UserRow};

pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Coordinator configuration for tests: temp-dir store, ephemeral ports,
/// and a dormant reaper so timing-sensitive tests drive reaping themselves.
/// Stall tests shorten the intervals through `start_with`.
pub fn test_config(tmp: &TempDir) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.worker_listen_addr = "127.0.0.1:0".parse().unwrap();
    config.api_listen_addr = "127.0.0.1:0".parse().unwrap();
    config.db_path = tmp.path().join("grid.db");
    config.artifacts_dir = tmp.path().join("artifacts");
    config.heartbeat_interval = Duration::from_secs(30);
    config.stall_grace = Duration::from_secs(3600);
    config.reaper_interval = Duration::from_secs(3600);
    config
}

/// Handle to a running test coordinator.
pub struct TestCoordinator {
    pub store: Store,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub worker_addr: SocketAddr,
    pub config: CoordinatorConfig,
    cancel: CancellationToken,
    server_handle: JoinHandle<()>,
    #[allow(dead_code)]
    tmp: TempDir,
}

impl TestCoordinator {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(adjust: impl FnOnce(&mut CoordinatorConfig)) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let mut config = test_config(&tmp);
        adjust(&mut config);

        let coordinator = Coordinator::new(config.clone()).await.expect("coordinator");
        let store = coordinator.store.clone();
        let registry = coordinator.registry.clone();
        let scheduler = coordinator.scheduler.clone();

        let cancel = CancellationToken::new();
        let (addr_tx, addr_rx) = tokio::sync::oneshot::channel();
        let run_cancel = cancel.clone();
        let server_handle = tokio::spawn(async move {
            if let Err(e) = coordinator.run_with_bound_addr(run_cancel, addr_tx).await {
                eprintln!("coordinator exited with error: {e}");
            }
        });
        let worker_addr = addr_rx.await.expect("coordinator failed to bind");

        Self {
            store,
            registry,
            scheduler,
            worker_addr,
            config,
            cancel,
            server_handle,
            tmp,
        }
    }

    pub async fn create_user(&self, username: &str, role: Role) -> UserRow {
        self.store
            .create_user(
                username,
                "password",
                role,
                self.config.credits.starting_balance,
            )
            .await
            .expect("create user")
    }

    /// Submit a job through the store at the formula cost, as the API does.
    pub async fn submit_job(
        &self,
        submitter: &UserRow,
        title: &str,
        demands: JobDemands,
        priority: i64,
    ) -> JobRow {
        self.submit_code(submitter, title, "print('ok')", demands, priority)
            .await
    }

    pub async fn submit_code(
        &self,
        submitter: &UserRow,
        title: &str,
        code: &str,
        demands: JobDemands,
        priority: i64,
    ) -> JobRow {
        let cost = job_cost(&demands);
        self.store
            .enqueue_job(
                &submitter.id,
                NewJob {
                    title: title.to_string(),
                    code: code.to_string(),
                    requirements: None,
                    demands,
                    priority,
                    cost,
                    reward: cost,
                },
            )
            .await
            .expect("enqueue job")
    }
}

impl Drop for TestCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.server_handle.abort();
    }
}

pub fn specs(cpu: u32, ram: f64, gpu: Option<&str>, docker: bool) -> WorkerSpecs {
    WorkerSpecs {
        cpu_cores: cpu,
        ram_gb: ram,
        gpu_name: gpu.map(String::from),
        docker_available: docker,
        os_family: None,
    }
}

pub fn demands(cpu: u32, ram: f64, gpu: bool, timeout: u32) -> JobDemands {
    JobDemands {
        cpu_cores: cpu,
        ram_gb: ram,
        gpu_required: gpu,
        docker_required: false,
        os_family: None,
        timeout_seconds: timeout,
    }
}

/// A scripted worker speaking the real framed protocol over TCP.
pub struct FakeWorker {
    pub worker_id: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl FakeWorker {
    /// Connect, register, and wait for the assigned worker id.
    pub async fn connect(
        addr: SocketAddr,
        name: &str,
        owner_token: Option<&str>,
        specs: WorkerSpecs,
    ) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (reader, writer) = stream.into_split();
        let mut worker = Self {
            worker_id: String::new(),
            reader,
            writer,
        };
        worker
            .send(WorkerMessage::Register {
                name: name.to_string(),
                owner_token: owner_token.map(String::from),
                specs,
            })
            .await;
        match worker.recv().await {
            CoordinatorMessage::Registered { worker_id } => worker.worker_id = worker_id,
            other => panic!("expected registered, got {other:?}"),
        }
        worker
    }

    /// A raw connection that has not registered, for protocol tests.
    pub async fn connect_raw(addr: SocketAddr) -> (OwnedReadHalf, OwnedWriteHalf) {
        TcpStream::connect(addr).await.expect("connect").into_split()
    }

    pub async fn send(&mut self, msg: WorkerMessage) {
        write_message(&mut self.writer, &msg, MAX_FRAME)
            .await
            .expect("send");
    }

    /// Write raw bytes straight onto the socket, bypassing the codec.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("send raw");
        self.writer.flush().await.expect("flush");
    }

    pub async fn recv(&mut self) -> CoordinatorMessage {
        self.try_recv().await.expect("read from coordinator")
    }

    pub async fn try_recv(&mut self) -> campus_grid::error::Result<CoordinatorMessage> {
        tokio::time::timeout(Duration::from_secs(5), read_message(&mut self.reader, MAX_FRAME))
            .await
            .expect("timed out waiting for coordinator")
    }

    pub async fn request_job(&mut self) -> CoordinatorMessage {
        let worker_id = self.worker_id.clone();
        self.send(WorkerMessage::RequestJob { worker_id }).await;
        self.recv().await
    }

    pub async fn heartbeat(&mut self, status: ReportedStatus) {
        let worker_id = self.worker_id.clone();
        self.send(WorkerMessage::Heartbeat { worker_id, status }).await;
    }

    /// Report a result and wait for the acknowledgement.
    pub async fn report(
        &mut self,
        job_id: &str,
        outcome: JobOutcome,
        stdout: &str,
        files: Vec<ArtifactFile>,
    ) -> CoordinatorMessage {
        self.send(WorkerMessage::JobResult {
            job_id: job_id.to_string(),
            outcome,
            reason: None,
            stdout: stdout.to_string(),
            stderr: String::new(),
            files,
            sandboxed: true,
        })
        .await;
        self.recv().await
    }

    pub async fn disconnect(mut self) {
        self.send(WorkerMessage::Disconnect {}).await;
    }
}

/// Wait for a condition to become true with timeout.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(50)).await;
    assert!(result, "{}", message);
}
