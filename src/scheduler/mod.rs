//! Job assignment, settlement, and stall recovery.
//!
//! Assignment and settlement are each a single store transaction; this module
//! decides the amounts (per the credit policy) and keeps the registry in step
//! with what the store committed.

pub mod matcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::{CreditPolicy, LimitsConfig};
use crate::error::{GridError, Result};
use crate::protocol::{ArtifactFile, JobOutcome};
use crate::registry::WorkerRegistry;
use crate::store::{ArtifactMeta, JobRow, JobStatus, Settlement, Store, WorkerStatus};

/// A `job_result` message, as received by a session.
#[derive(Debug, Clone)]
pub struct IncomingResult {
    pub job_id: String,
    pub outcome: JobOutcome,
    pub reason: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub files: Vec<ArtifactFile>,
    pub sandboxed: bool,
}

pub struct Scheduler {
    store: Store,
    registry: Arc<WorkerRegistry>,
    policy: CreditPolicy,
    limits: LimitsConfig,
    artifacts_dir: PathBuf,
}

impl Scheduler {
    pub fn new(
        store: Store,
        registry: Arc<WorkerRegistry>,
        policy: CreditPolicy,
        limits: LimitsConfig,
        artifacts_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            limits,
            artifacts_dir,
        }
    }

    /// Claim the next matching queue entry for a requesting worker.
    ///
    /// Returns `None` when the worker is unknown, already busy, or no pending
    /// job matches its specs. Racing workers serialize inside the store; each
    /// queue entry goes to exactly one of them.
    pub async fn assign_to(&self, worker_id: &str) -> Result<Option<JobRow>> {
        let Some((specs, status)) = self.registry.specs_and_status(worker_id).await else {
            return Err(GridError::WorkerNotFound(worker_id.to_string()));
        };
        if status == WorkerStatus::Busy {
            return Ok(None);
        }

        let Some(job) = self.store.assign_next_job(worker_id, &specs).await? else {
            return Ok(None);
        };
        self.registry.mark_busy(worker_id, &job.id).await;
        tracing::info!(job_id = %job.id, worker_id, "Job assigned");
        Ok(Some(job))
    }

    /// Roll back an assignment whose job frame never reached the worker: the
    /// job is settled failed with the submitter refunded in full, so the
    /// submitter sees a clear outcome instead of a silently retried job.
    pub async fn fail_delivery(&self, job: &JobRow) -> Result<()> {
        let mut settlement = Settlement::new(JobStatus::Failed);
        settlement.reason = Some("worker_lost".to_string());
        settlement.refund_submitter = job.credit_cost;
        self.store.settle_job(&job.id, settlement).await?;
        if let Some(worker_id) = &job.worker_id {
            self.registry.mark_idle(worker_id).await;
        }
        tracing::warn!(job_id = %job.id, "Assignment rolled back, job frame undeliverable");
        Ok(())
    }

    /// Settle a job from a worker-reported result.
    ///
    /// Late results (the job was already reaped) and results for jobs the
    /// session's worker was never assigned are rejected without state change.
    pub async fn handle_result(&self, worker_id: &str, result: IncomingResult) -> Result<JobRow> {
        let job = self
            .store
            .get_job(&result.job_id)
            .await?
            .ok_or_else(|| GridError::JobNotFound(result.job_id.clone()))?;
        if job.worker_id.as_deref() != Some(worker_id) {
            return Err(GridError::Forbidden);
        }
        if job.status != JobStatus::Running {
            return Err(GridError::NotRunning(job.id.clone()));
        }

        let mut stderr = truncate_to(&result.stderr, self.limits.max_output_bytes);
        let artifacts = self
            .save_artifacts(&job.id, &result.files, &mut stderr)
            .await?;

        let mut settlement = Settlement::new(match result.outcome {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed => JobStatus::Failed,
            JobOutcome::TimedOut => JobStatus::TimedOut,
        });
        settlement.stdout = Some(truncate_to(&result.stdout, self.limits.max_output_bytes));
        settlement.stderr = Some(stderr);
        settlement.reason = result.reason;
        settlement.artifacts = artifacts;
        settlement.sandboxed = Some(result.sandboxed);

        match result.outcome {
            JobOutcome::Completed => {
                let owned = match self.store.worker_by_id(worker_id).await? {
                    Some(row) => row.owner_id.is_some(),
                    None => false,
                };
                // Anonymous workers execute for nothing; there is no payee.
                settlement.credit_worker = if owned { job.credit_reward } else { 0 };
            }
            JobOutcome::Failed => {
                if self.policy.refund_on_failure {
                    settlement.refund_submitter = job.credit_cost;
                }
            }
            JobOutcome::TimedOut => {
                settlement.refund_submitter = self.timeout_refund(job.credit_cost);
            }
        }

        let settled = self.store.settle_job(&job.id, settlement).await?;
        self.registry.mark_idle(worker_id).await;
        self.store
            .update_worker_liveness(worker_id, WorkerStatus::Idle, Utc::now())
            .await?;

        tracing::info!(
            job_id = %settled.id,
            worker_id,
            status = %settled.status,
            "Job settled"
        );
        Ok(settled)
    }

    /// Periodic stall recovery. Runs until the token is cancelled.
    pub async fn run_reaper(
        self: Arc<Self>,
        interval: Duration,
        stall_grace: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap(Utc::now(), stall_grace).await {
                        tracing::error!(error = %e, "Reaper pass failed");
                    }
                }
            }
        }
    }

    /// One reaper pass: fail jobs whose worker has been gone past the grace
    /// period (full refund), and time out jobs running past twice their own
    /// timeout even if the worker still answers.
    pub async fn reap(&self, now: DateTime<Utc>, stall_grace: Duration) -> Result<usize> {
        let grace = chrono::Duration::from_std(stall_grace).unwrap_or(chrono::Duration::zero());
        let mut reaped = 0;

        for job in self.store.running_jobs().await? {
            let Some(worker_id) = job.worker_id.clone() else {
                continue;
            };

            let worker_lost = if self.registry.contains(&worker_id).await {
                false
            } else {
                let last_seen = self
                    .store
                    .worker_by_id(&worker_id)
                    .await?
                    .and_then(|w| w.last_heartbeat_at);
                match last_seen {
                    Some(at) => now - at > grace,
                    None => true,
                }
            };

            let overdue = job
                .started_at
                .map(|started| now - started > chrono::Duration::seconds(2 * job.timeout_seconds))
                .unwrap_or(false);

            let settlement = if worker_lost {
                let mut s = Settlement::new(JobStatus::Failed);
                s.reason = Some("worker_lost".to_string());
                s.refund_submitter = job.credit_cost;
                s
            } else if overdue {
                let mut s = Settlement::new(JobStatus::TimedOut);
                s.reason = Some("timeout".to_string());
                s.refund_submitter = self.timeout_refund(job.credit_cost);
                s
            } else {
                continue;
            };

            match self.store.settle_job(&job.id, settlement).await {
                Ok(settled) => {
                    reaped += 1;
                    tracing::warn!(
                        job_id = %settled.id,
                        %worker_id,
                        status = %settled.status,
                        "Reaped stalled job"
                    );
                }
                // A live result won the race; nothing to do.
                Err(GridError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(reaped)
    }

    fn timeout_refund(&self, cost: i64) -> i64 {
        cost * i64::from(self.policy.timeout_refund_percent) / 100
    }

    /// Decode and persist result files under `artifacts_dir/<job_id>/`.
    /// Files with unsafe names, undecodable bodies, or that would push the
    /// bundle past the total cap are dropped with a notice appended to
    /// stderr.
    async fn save_artifacts(
        &self,
        job_id: &str,
        files: &[ArtifactFile],
        stderr: &mut String,
    ) -> Result<Vec<ArtifactMeta>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let dir = self.artifacts_dir.join(job_id);
        tokio::fs::create_dir_all(&dir).await?;

        let mut kept = Vec::new();
        let mut total = 0usize;
        for file in files {
            if !is_safe_file_name(&file.name) {
                stderr.push_str(&format!("\n[artifact dropped: unsafe name {:?}]", file.name));
                continue;
            }
            let bytes = match BASE64.decode(&file.bytes_b64) {
                Ok(bytes) => bytes,
                Err(_) => {
                    stderr.push_str(&format!("\n[artifact dropped: bad encoding {:?}]", file.name));
                    continue;
                }
            };
            if total + bytes.len() > self.limits.max_artifact_bytes {
                stderr.push_str(&format!("\n[artifact dropped: over size cap {:?}]", file.name));
                continue;
            }
            total += bytes.len();
            tokio::fs::write(dir.join(&file.name), &bytes).await?;
            kept.push(ArtifactMeta {
                name: file.name.clone(),
                size: bytes.len() as u64,
            });
        }
        Ok(kept)
    }
}

/// True for plain file names: a single non-empty path component.
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

fn truncate_to(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_string();
    out.push_str("\n[output truncated]");
    out
}
