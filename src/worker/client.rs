//! Worker-side session: register with the coordinator, keep heartbeats
//! flowing, and run the request/execute/report loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{GridError, Result};
use crate::protocol::{
    read_message, write_message, CoordinatorMessage, ReportedStatus, WorkerMessage,
};
use crate::worker::sandbox::{JobAssignment, SandboxExecutor};
use crate::worker::sysinfo;

/// How long to wait for a coordinator reply before giving the link up.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Connect to the coordinator and work until the token is cancelled or the
/// link drops.
pub async fn run_worker(config: WorkerConfig, cancel: CancellationToken) -> Result<()> {
    let specs = sysinfo::detect_specs(config.sandbox.enabled).await;
    tracing::info!(
        name = %config.name,
        cpu_cores = specs.cpu_cores,
        ram_gb = specs.ram_gb,
        gpu = specs.gpu_name.as_deref().unwrap_or("none"),
        docker = specs.docker_available,
        "Detected host specs"
    );
    let executor = SandboxExecutor::new(
        config.sandbox.clone(),
        config.limits.clone(),
        specs.docker_available,
    );

    let stream = TcpStream::connect(&config.manager_addr).await?;
    tracing::info!(manager = %config.manager_addr, "Connected to coordinator");
    let (mut reader, writer) = stream.into_split();
    let max_frame = config.limits.max_frame_bytes;

    let (outbound, outbound_rx) = mpsc::channel::<WorkerMessage>(16);
    let session = cancel.child_token();
    let writer_handle = tokio::spawn(write_outbound(writer, outbound_rx, session.clone(), max_frame));

    // Register and wait for our assigned identity.
    outbound
        .send(WorkerMessage::Register {
            name: config.name.clone(),
            owner_token: config.owner_token.clone(),
            specs,
        })
        .await
        .map_err(|_| GridError::ConnectionClosed)?;
    let reply: CoordinatorMessage =
        tokio::time::timeout(REPLY_TIMEOUT, read_message(&mut reader, max_frame))
            .await
            .map_err(|_| GridError::Protocol("registration timed out".to_string()))??;
    let CoordinatorMessage::Registered { worker_id } = reply else {
        return Err(GridError::Protocol(format!(
            "expected registered, got {reply:?}"
        )));
    };
    tracing::info!(%worker_id, "Registered with coordinator");

    // Heartbeats run independently of the job loop so a long execution never
    // looks like a dead worker.
    let busy = Arc::new(AtomicBool::new(false));
    let heartbeat = tokio::spawn(heartbeat_loop(
        outbound.clone(),
        worker_id.clone(),
        busy.clone(),
        config.heartbeat_interval,
        session.clone(),
    ));

    let outcome = job_loop(
        &config,
        &executor,
        &mut reader,
        &outbound,
        &worker_id,
        &busy,
        &session,
    )
    .await;

    session.cancel();
    heartbeat.abort();
    let _ = writer_handle.await;
    tracing::info!(%worker_id, "Worker stopped");
    outcome
}

async fn job_loop(
    config: &WorkerConfig,
    executor: &SandboxExecutor,
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    outbound: &mpsc::Sender<WorkerMessage>,
    worker_id: &str,
    busy: &AtomicBool,
    session: &CancellationToken,
) -> Result<()> {
    let max_frame = config.limits.max_frame_bytes;

    loop {
        if session.is_cancelled() {
            let _ = outbound.send(WorkerMessage::Disconnect {}).await;
            return Ok(());
        }

        outbound
            .send(WorkerMessage::RequestJob {
                worker_id: worker_id.to_string(),
            })
            .await
            .map_err(|_| GridError::ConnectionClosed)?;

        let reply = tokio::select! {
            _ = session.cancelled() => {
                let _ = outbound.send(WorkerMessage::Disconnect {}).await;
                return Ok(());
            }
            read = tokio::time::timeout(REPLY_TIMEOUT, read_message::<CoordinatorMessage, _>(reader, max_frame)) => {
                read.map_err(|_| GridError::Protocol("coordinator stopped answering".to_string()))??
            }
        };

        match reply {
            CoordinatorMessage::Job {
                job_id,
                title,
                code,
                requirements,
                cpu_cores,
                ram_gb,
                timeout_seconds,
                credit_reward,
            } => {
                tracing::info!(%job_id, %title, credit_reward, "Executing job");
                busy.store(true, Ordering::SeqCst);
                let started = std::time::Instant::now();
                let result = executor
                    .execute(&JobAssignment {
                        job_id: job_id.clone(),
                        code,
                        requirements,
                        cpu_cores,
                        ram_gb,
                        timeout_seconds,
                    })
                    .await;
                tracing::info!(
                    %job_id,
                    outcome = ?result.outcome,
                    elapsed_secs = started.elapsed().as_secs(),
                    "Job finished"
                );

                outbound
                    .send(WorkerMessage::JobResult {
                        job_id: job_id.clone(),
                        outcome: result.outcome,
                        reason: result.reason,
                        stdout: result.stdout,
                        stderr: result.stderr,
                        files: result.files,
                        sandboxed: result.sandboxed,
                    })
                    .await
                    .map_err(|_| GridError::ConnectionClosed)?;

                // The coordinator acknowledges every result.
                let ack: CoordinatorMessage =
                    tokio::time::timeout(REPLY_TIMEOUT, read_message(reader, max_frame))
                        .await
                        .map_err(|_| {
                            GridError::Protocol("no acknowledgement for job result".to_string())
                        })??;
                match ack {
                    CoordinatorMessage::JobReceived { job_id: acked } if acked == job_id => {}
                    other => {
                        return Err(GridError::Protocol(format!(
                            "expected job_received for {job_id}, got {other:?}"
                        )));
                    }
                }
                busy.store(false, Ordering::SeqCst);
            }
            CoordinatorMessage::NoJob {} => {
                tokio::select! {
                    _ = session.cancelled() => {}
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            other => {
                return Err(GridError::Protocol(format!(
                    "unexpected message from coordinator: {other:?}"
                )));
            }
        }
    }
}

async fn heartbeat_loop(
    outbound: mpsc::Sender<WorkerMessage>,
    worker_id: String,
    busy: Arc<AtomicBool>,
    interval: Duration,
    session: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            _ = ticker.tick() => {
                let status = if busy.load(Ordering::SeqCst) {
                    ReportedStatus::Busy
                } else {
                    ReportedStatus::Idle
                };
                if outbound
                    .send(WorkerMessage::Heartbeat {
                        worker_id: worker_id.clone(),
                        status,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

async fn write_outbound(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<WorkerMessage>,
    session: CancellationToken,
    max_frame: usize,
) {
    loop {
        let msg = tokio::select! {
            _ = session.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            }
        };
        if let Err(e) = write_message(&mut writer, &msg, max_frame).await {
            tracing::debug!(error = %e, "Write to coordinator failed");
            session.cancel();
            break;
        }
    }
}
