//! Session server: accepts worker sockets and runs one session per worker.
//!
//! Each session is a reader loop plus a writer task sharing a bounded
//! outbound channel. The first frame must be `register`; afterwards messages
//! are dispatched to the registry and scheduler in arrival order. Protocol
//! violations, heartbeat gaps, and outbound overflow all end the session,
//! never the server.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::CoordinatorConfig;
use crate::error::{GridError, Result};
use crate::protocol::{read_message, write_message, CoordinatorMessage, WorkerMessage};
use crate::registry::{WorkerEntry, WorkerRegistry};
use crate::scheduler::{IncomingResult, Scheduler};
use crate::store::{JobRow, Store, WorkerStatus};

/// Shared handles every session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<CoordinatorConfig>,
    pub store: Store,
    pub registry: Arc<WorkerRegistry>,
    pub scheduler: Arc<Scheduler>,
}

pub struct SessionServer {
    ctx: SessionContext,
}

impl SessionServer {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }

    /// Accept worker connections until the token is cancelled. Sessions run
    /// independently; a failed session never takes the acceptor down.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let (listener, _) = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Bind the configured address, returning the listener and the actual
    /// address (relevant when configured with port 0).
    pub async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let listener = TcpListener::bind(self.ctx.config.worker_listen_addr).await?;
        let addr = listener.local_addr()?;
        Ok((listener, addr))
    }

    /// Accept loop over an already-bound listener; see [`Self::run`].
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "Worker server listening");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Worker server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let ctx = self.ctx.clone();
                            let session_cancel = cancel.child_token();
                            tokio::spawn(async move {
                                handle_session(ctx, socket, peer, session_cancel).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Accept failed");
                        }
                    }
                }
            }
        }
    }
}

async fn handle_session(
    ctx: SessionContext,
    socket: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let max_frame = ctx.config.limits.max_frame_bytes;
    let read_timeout = ctx.config.session_read_timeout();
    let (mut reader, writer) = socket.into_split();

    // The first frame must be a well-formed register.
    let first = match timeout(read_timeout, read_message::<WorkerMessage, _>(&mut reader, max_frame)).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            tracing::debug!(%peer, error = %e, "Session ended before registration");
            return;
        }
        Err(_) => {
            tracing::debug!(%peer, "Registration timed out");
            return;
        }
    };
    let WorkerMessage::Register {
        name,
        owner_token,
        specs,
    } = first
    else {
        tracing::warn!(%peer, "First message was not register, closing");
        return;
    };
    if specs.cpu_cores == 0 || specs.ram_gb <= 0.0 {
        tracing::warn!(%peer, worker = %name, "Rejected register with non-positive resources");
        return;
    }

    let owner_id = match owner_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => match ctx.store.user_by_username(token).await {
            Ok(Some(user)) => Some(user.id),
            Ok(None) => {
                tracing::warn!(%peer, worker = %name, "Unknown owner token, registering anonymously");
                None
            }
            Err(e) => {
                tracing::error!(%peer, error = %e, "Owner lookup failed");
                return;
            }
        },
        None => None,
    };

    let worker = match ctx
        .store
        .register_worker(owner_id.as_deref(), &name, &specs)
        .await
    {
        Ok(worker) => worker,
        Err(e) => {
            tracing::error!(%peer, worker = %name, error = %e, "Worker registration failed");
            return;
        }
    };
    let worker_id = worker.id.clone();

    let (outbound, outbound_rx) = mpsc::channel(ctx.config.session_send_capacity);
    ctx.registry
        .attach(WorkerEntry {
            worker_id: worker_id.clone(),
            name: name.clone(),
            owner_id,
            specs,
            status: WorkerStatus::Idle,
            assigned_job: None,
            last_heartbeat: std::time::Instant::now(),
            outbound: outbound.clone(),
        })
        .await;
    tracing::info!(%worker_id, worker = %name, %peer, "Worker connected");

    let session = cancel.child_token();
    let writer_handle = tokio::spawn(write_outbound(writer, outbound_rx, session.clone(), max_frame));

    let reason = if outbound
        .try_send(CoordinatorMessage::Registered {
            worker_id: worker_id.clone(),
        })
        .is_err()
    {
        "send channel overflow"
    } else {
        session_loop(&ctx, &mut reader, &outbound, &worker_id, read_timeout, &session).await
    };

    // Teardown: stop the writer, drop the live entry, record the worker
    // offline. Any job still assigned stays running until the reaper's grace
    // expires, in case the worker reconnects with a result.
    session.cancel();
    ctx.registry.detach(&worker_id).await;
    if let Err(e) = ctx
        .store
        .update_worker_liveness(&worker_id, WorkerStatus::Offline, Utc::now())
        .await
    {
        tracing::error!(%worker_id, error = %e, "Failed to mark worker offline");
    }
    let _ = writer_handle.await;
    tracing::info!(%worker_id, worker = %name, %peer, reason, "Worker disconnected");
}

async fn session_loop(
    ctx: &SessionContext,
    reader: &mut OwnedReadHalf,
    outbound: &mpsc::Sender<CoordinatorMessage>,
    worker_id: &str,
    read_timeout: std::time::Duration,
    session: &CancellationToken,
) -> &'static str {
    loop {
        let msg = tokio::select! {
            _ = session.cancelled() => return "shutdown",
            read = timeout(read_timeout, read_message::<WorkerMessage, _>(reader, ctx.config.limits.max_frame_bytes)) => {
                match read {
                    Err(_) => return "heartbeat gap",
                    Ok(Err(GridError::ConnectionClosed)) => return "connection closed",
                    Ok(Err(e)) => {
                        tracing::warn!(worker_id, error = %e, "Closing session");
                        return "protocol violation";
                    }
                    Ok(Ok(msg)) => msg,
                }
            }
        };

        match msg {
            WorkerMessage::Register { .. } => {
                tracing::warn!(worker_id, "Duplicate register");
                return "protocol violation";
            }
            WorkerMessage::Heartbeat {
                worker_id: claimed,
                status,
            } => {
                if claimed != worker_id {
                    return "protocol violation";
                }
                ctx.registry.heartbeat(worker_id, status).await;
            }
            WorkerMessage::RequestJob { worker_id: claimed } => {
                if claimed != worker_id {
                    return "protocol violation";
                }
                match ctx.scheduler.assign_to(worker_id).await {
                    Ok(Some(job)) => {
                        if outbound.try_send(job_offer(&job)).is_err() {
                            // The frame never left the coordinator; roll the
                            // assignment back so the submitter sees a clear
                            // outcome.
                            if let Err(e) = ctx.scheduler.fail_delivery(&job).await {
                                tracing::error!(job_id = %job.id, error = %e, "Rollback failed");
                            }
                            return "send channel overflow";
                        }
                    }
                    Ok(None) => {
                        if outbound.try_send(CoordinatorMessage::NoJob {}).is_err() {
                            return "send channel overflow";
                        }
                    }
                    Err(e) => {
                        // Store trouble fails this request, not the session.
                        tracing::error!(worker_id, error = %e, "Assignment failed");
                        if outbound.try_send(CoordinatorMessage::NoJob {}).is_err() {
                            return "send channel overflow";
                        }
                    }
                }
            }
            WorkerMessage::JobResult {
                job_id,
                outcome,
                reason,
                stdout,
                stderr,
                files,
                sandboxed,
            } => {
                let result = IncomingResult {
                    job_id: job_id.clone(),
                    outcome,
                    reason,
                    stdout,
                    stderr,
                    files,
                    sandboxed,
                };
                match ctx.scheduler.handle_result(worker_id, result).await {
                    Ok(_) => {}
                    Err(GridError::NotRunning(_)) | Err(GridError::JobNotFound(_)) => {
                        tracing::warn!(worker_id, %job_id, "Late or unknown result rejected");
                    }
                    Err(GridError::Forbidden) => {
                        tracing::warn!(worker_id, %job_id, "Result for another worker's job");
                        return "protocol violation";
                    }
                    Err(e) => {
                        tracing::error!(worker_id, %job_id, error = %e, "Settle failed");
                    }
                }
                if outbound
                    .try_send(CoordinatorMessage::JobReceived { job_id })
                    .is_err()
                {
                    return "send channel overflow";
                }
            }
            WorkerMessage::Disconnect {} => return "graceful disconnect",
        }
    }
}

async fn write_outbound(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<CoordinatorMessage>,
    session: CancellationToken,
    max_frame: usize,
) {
    loop {
        tokio::select! {
            _ = session.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = write_message(&mut writer, &msg, max_frame).await {
                        tracing::debug!(error = %e, "Session write failed");
                        session.cancel();
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

fn job_offer(job: &JobRow) -> CoordinatorMessage {
    CoordinatorMessage::Job {
        job_id: job.id.clone(),
        title: job.title.clone(),
        code: job.code.clone(),
        requirements: job.requirements.clone(),
        cpu_cores: job.cpu_cores as u32,
        ram_gb: job.ram_gb,
        timeout_seconds: job.timeout_seconds as u32,
        credit_reward: job.credit_reward,
    }
}
