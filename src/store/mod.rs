//! Durable state: users, workers, jobs, the pending queue, and the credit
//! ledger, backed by SQLite.
//!
//! The store is the source of truth; the in-memory registry only caches the
//! workers currently connected. Every operation here is a single transaction,
//! and every balance change inserts a ledger row in that same transaction.
//! Writes are serialized by a single-connection pool, which makes
//! [`Store::assign_next_job`] serializable against concurrent assigners.

pub mod password;
pub mod types;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indoc::indoc;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::protocol::{JobDemands, WorkerSpecs};
use crate::scheduler::matcher::demands_satisfied;

pub use types::{
    ArtifactMeta, JobRow, JobStatus, LeaderboardEntry, LedgerKind, LedgerRow, QueueStats, Role,
    UserRow, WorkerRow, WorkerStatus,
};

static MIGRATOR: Migrator = sqlx::migrate!();

/// A job as accepted by the submission API, before it has an id.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub code: String,
    pub requirements: Option<String>,
    pub demands: JobDemands,
    pub priority: i64,
    pub cost: i64,
    pub reward: i64,
}

/// How a running job leaves the `running` state.
///
/// The scheduler decides the amounts per its credit policy; the store applies
/// the status write, the result payload, and both ledger movements in one
/// transaction. Settling a job that is not `running` is rejected.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub status: JobStatus,
    pub reason: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub artifacts: Vec<ArtifactMeta>,
    pub sandboxed: Option<bool>,
    /// Credited to the worker's owner, if it has one.
    pub credit_worker: i64,
    /// Refunded to the submitter.
    pub refund_submitter: i64,
}

impl Settlement {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            reason: None,
            stdout: None,
            stderr: None,
            artifacts: Vec::new(),
            sandboxed: None,
            credit_worker: 0,
            refund_submitter: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) and migrate the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        // One connection: transactions queue at the pool instead of hitting
        // SQLITE_BUSY against each other.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    // ==== users ====

    /// Create a user and grant the starting balance, as one transaction.
    pub async fn create_user(
        &self,
        username: &str,
        password: &str,
        role: Role,
        starting_balance: i64,
    ) -> Result<UserRow> {
        let id = Uuid::new_v4().to_string();
        let verifier = password::hash_password(password);
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let insert = indoc! {r#"
            INSERT INTO users (id, username, password_verifier, role, credits, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
        "#};
        sqlx::query(insert)
            .bind(&id)
            .bind(username)
            .bind(&verifier)
            .bind(role)
            .bind(starting_balance)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    GridError::Invalid(format!("username already taken: {username}"))
                } else {
                    e.into()
                }
            })?;

        if starting_balance > 0 {
            insert_ledger(
                &mut *tx,
                &id,
                starting_balance,
                LedgerKind::SignupGrant,
                None,
                Some("welcome grant"),
                now,
            )
            .await?;
        }

        tx.commit().await?;
        tracing::info!(user = username, role = %role, "User created");

        self.user_by_id(&id)
            .await?
            .ok_or_else(|| GridError::UserNotFound(id))
    }

    pub async fn user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        let row = sqlx::query_as("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT credits FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        balance.ok_or_else(|| GridError::UserNotFound(user_id.to_string()))
    }

    pub async fn ledger_for_user(&self, user_id: &str) -> Result<Vec<LedgerRow>> {
        let rows = sqlx::query_as("SELECT * FROM credit_ledger WHERE user_id = ? ORDER BY id ASC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Apply a signed delta to a balance, with its ledger row. Fails without
    /// side effects if the balance would go negative.
    pub async fn adjust_credits(
        &self,
        user_id: &str,
        delta: i64,
        kind: LedgerKind,
        job_id: Option<&str>,
        note: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let user: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        let user = user.ok_or_else(|| GridError::UserNotFound(user_id.to_string()))?;
        if user.credits + delta < 0 {
            return Err(GridError::InsufficientCredits {
                needed: -delta,
                available: user.credits,
            });
        }

        sqlx::query("UPDATE users SET credits = credits + ? WHERE id = ?")
            .bind(delta)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        insert_ledger(&mut *tx, user_id, delta, kind, job_id, note, now).await?;

        tx.commit().await?;
        Ok(user.credits + delta)
    }

    // ==== workers ====

    /// Register a worker, re-adopting the existing row for a known
    /// `(owner, name)` pair so a reconnecting machine keeps its identity and
    /// lifetime counters. Anonymous workers always get a fresh row.
    pub async fn register_worker(
        &self,
        owner_id: Option<&str>,
        name: &str,
        specs: &WorkerSpecs,
    ) -> Result<WorkerRow> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<WorkerRow> = match owner_id {
            Some(owner) => {
                sqlx::query_as("SELECT * FROM workers WHERE owner_id = ? AND name = ?")
                    .bind(owner)
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };

        let id = match existing {
            Some(row) => {
                let update = indoc! {r#"
                    UPDATE workers
                    SET status = 'idle', cpu_cores = ?, ram_gb = ?, gpu_name = ?,
                        docker_available = ?, os_family = ?, last_heartbeat_at = ?
                    WHERE id = ?
                "#};
                sqlx::query(update)
                    .bind(specs.cpu_cores as i64)
                    .bind(specs.ram_gb)
                    .bind(&specs.gpu_name)
                    .bind(specs.docker_available)
                    .bind(&specs.os_family)
                    .bind(now)
                    .bind(&row.id)
                    .execute(&mut *tx)
                    .await?;
                row.id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                let insert = indoc! {r#"
                    INSERT INTO workers (id, name, owner_id, status, cpu_cores, ram_gb, gpu_name,
                                         docker_available, os_family, last_heartbeat_at, created_at)
                    VALUES (?, ?, ?, 'idle', ?, ?, ?, ?, ?, ?, ?)
                "#};
                sqlx::query(insert)
                    .bind(&id)
                    .bind(name)
                    .bind(owner_id)
                    .bind(specs.cpu_cores as i64)
                    .bind(specs.ram_gb)
                    .bind(&specs.gpu_name)
                    .bind(specs.docker_available)
                    .bind(&specs.os_family)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                id
            }
        };

        tx.commit().await?;

        self.worker_by_id(&id)
            .await?
            .ok_or_else(|| GridError::WorkerNotFound(id))
    }

    pub async fn update_worker_liveness(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE workers SET status = ?, last_heartbeat_at = ? WHERE id = ?")
            .bind(status)
            .bind(at)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn worker_by_id(&self, id: &str) -> Result<Option<WorkerRow>> {
        let row = sqlx::query_as("SELECT * FROM workers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        let rows =
            sqlx::query_as("SELECT * FROM workers ORDER BY status ASC, last_heartbeat_at DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    pub async fn workers_for_owner(&self, owner_id: &str) -> Result<Vec<WorkerRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM workers WHERE owner_id = ? ORDER BY last_heartbeat_at DESC",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ==== jobs ====

    /// Insert a job, its queue entry, and the submitter's debit atomically.
    /// Fails without side effects when the balance does not cover the cost.
    pub async fn enqueue_job(&self, submitter_id: &str, job: NewJob) -> Result<JobRow> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let user: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(submitter_id)
            .fetch_optional(&mut *tx)
            .await?;
        let user = user.ok_or_else(|| GridError::UserNotFound(submitter_id.to_string()))?;
        if user.credits < job.cost {
            return Err(GridError::InsufficientCredits {
                needed: job.cost,
                available: user.credits,
            });
        }

        sqlx::query("UPDATE users SET credits = credits - ? WHERE id = ?")
            .bind(job.cost)
            .bind(submitter_id)
            .execute(&mut *tx)
            .await?;

        let insert = indoc! {r#"
            INSERT INTO jobs (id, title, submitter_id, status, priority, code, requirements,
                              cpu_cores, ram_gb, gpu_required, docker_required, os_family,
                              timeout_seconds, credit_cost, credit_reward, submitted_at)
            VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#};
        sqlx::query(insert)
            .bind(&id)
            .bind(&job.title)
            .bind(submitter_id)
            .bind(job.priority)
            .bind(&job.code)
            .bind(&job.requirements)
            .bind(job.demands.cpu_cores as i64)
            .bind(job.demands.ram_gb)
            .bind(job.demands.gpu_required)
            .bind(job.demands.docker_required)
            .bind(&job.demands.os_family)
            .bind(job.demands.timeout_seconds as i64)
            .bind(job.cost)
            .bind(job.reward)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO job_queue (job_id, priority, queued_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(job.priority)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        let note = format!("submitted: {}", job.title);
        insert_ledger(
            &mut *tx,
            submitter_id,
            -job.cost,
            LedgerKind::JobDebit,
            Some(&id),
            Some(note.as_str()),
            now,
        )
        .await?;

        tx.commit().await?;

        self.get_job(&id)
            .await?
            .ok_or_else(|| GridError::JobNotFound(id))
    }

    /// Walk the queue in (priority DESC, queued_at ASC, job id) order and
    /// claim the first entry whose demands the worker satisfies: the job is
    /// marked running and its queue entry removed in one transaction, so two
    /// racing workers can never claim the same entry.
    pub async fn assign_next_job(
        &self,
        worker_id: &str,
        specs: &WorkerSpecs,
    ) -> Result<Option<JobRow>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let queue_order = indoc! {r#"
            SELECT j.* FROM jobs j
            JOIN job_queue q ON q.job_id = j.id
            WHERE j.status = 'pending'
            ORDER BY q.priority DESC, q.queued_at ASC, j.id ASC
        "#};
        let pending: Vec<JobRow> = sqlx::query_as(queue_order).fetch_all(&mut *tx).await?;

        let Some(job) = pending
            .into_iter()
            .find(|j| demands_satisfied(&j.demands(), specs))
        else {
            return Ok(None);
        };

        sqlx::query(
            "UPDATE jobs SET status = 'running', worker_id = ?, started_at = ? WHERE id = ?",
        )
        .bind(worker_id)
        .bind(now)
        .bind(&job.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM job_queue WHERE job_id = ?")
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE workers SET status = 'busy' WHERE id = ?")
            .bind(worker_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.get_job(&job.id).await
    }

    /// Transition a running job to a terminal status, persist its result, and
    /// move the reward/refund credits, all in one transaction.
    pub async fn settle_job(&self, job_id: &str, settlement: Settlement) -> Result<JobRow> {
        let status = settlement.status;
        if !status.is_terminal() {
            return Err(GridError::Invalid(format!(
                "settlement status must be terminal, got {status}"
            )));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let job: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let job = job.ok_or_else(|| GridError::JobNotFound(job_id.to_string()))?;
        if job.status != JobStatus::Running {
            return Err(GridError::NotRunning(job_id.to_string()));
        }

        let artifacts_json = if settlement.artifacts.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&settlement.artifacts)?)
        };

        let update = indoc! {r#"
            UPDATE jobs
            SET status = ?, stdout = ?, stderr = ?, error_reason = ?, artifacts = ?,
                ran_sandboxed = ?, finished_at = ?
            WHERE id = ?
        "#};
        sqlx::query(update)
            .bind(status)
            .bind(&settlement.stdout)
            .bind(&settlement.stderr)
            .bind(&settlement.reason)
            .bind(&artifacts_json)
            .bind(settlement.sandboxed)
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        if status == JobStatus::Completed {
            if let Some(worker_id) = &job.worker_id {
                sqlx::query(
                    "UPDATE workers SET jobs_completed = jobs_completed + 1, \
                     credits_earned = credits_earned + ? WHERE id = ?",
                )
                .bind(settlement.credit_worker)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;

                if settlement.credit_worker > 0 {
                    let owner: Option<Option<String>> =
                        sqlx::query_scalar("SELECT owner_id FROM workers WHERE id = ?")
                            .bind(worker_id)
                            .fetch_optional(&mut *tx)
                            .await?;
                    if let Some(Some(owner_id)) = owner {
                        sqlx::query("UPDATE users SET credits = credits + ? WHERE id = ?")
                            .bind(settlement.credit_worker)
                            .bind(&owner_id)
                            .execute(&mut *tx)
                            .await?;
                        let note = format!("completed: {}", job.title);
                        insert_ledger(
                            &mut *tx,
                            &owner_id,
                            settlement.credit_worker,
                            LedgerKind::JobCredit,
                            Some(job_id),
                            Some(note.as_str()),
                            now,
                        )
                        .await?;
                    }
                }
            }
        }

        if settlement.refund_submitter > 0 {
            sqlx::query("UPDATE users SET credits = credits + ? WHERE id = ?")
                .bind(settlement.refund_submitter)
                .bind(&job.submitter_id)
                .execute(&mut *tx)
                .await?;
            let note = format!("refund: {}", job.title);
            insert_ledger(
                &mut *tx,
                &job.submitter_id,
                settlement.refund_submitter,
                LedgerKind::JobCredit,
                Some(job_id),
                Some(note.as_str()),
                now,
            )
            .await?;
        }

        tx.commit().await?;

        self.get_job(job_id)
            .await?
            .ok_or_else(|| GridError::JobNotFound(job_id.to_string()))
    }

    /// Cancel a pending job and refund the full cost. Only the submitter may
    /// cancel, and only while the job is still queued.
    pub async fn cancel_pending(&self, job_id: &str, submitter_id: &str) -> Result<JobRow> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let job: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let job = job.ok_or_else(|| GridError::JobNotFound(job_id.to_string()))?;
        if job.submitter_id != submitter_id {
            return Err(GridError::Forbidden);
        }
        if job.status != JobStatus::Pending {
            return Err(GridError::NotPending(job_id.to_string()));
        }

        sqlx::query("UPDATE jobs SET status = 'cancelled', finished_at = ? WHERE id = ?")
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM job_queue WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE users SET credits = credits + ? WHERE id = ?")
            .bind(job.credit_cost)
            .bind(submitter_id)
            .execute(&mut *tx)
            .await?;
        let note = format!("cancelled: {}", job.title);
        insert_ledger(
            &mut *tx,
            submitter_id,
            job.credit_cost,
            LedgerKind::JobCredit,
            Some(job_id),
            Some(note.as_str()),
            now,
        )
        .await?;

        tx.commit().await?;

        self.get_job(job_id)
            .await?
            .ok_or_else(|| GridError::JobNotFound(job_id.to_string()))
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn jobs_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as(
            "SELECT * FROM jobs WHERE submitter_id = ? ORDER BY submitted_at DESC, id LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn running_jobs(&self) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as("SELECT * FROM jobs WHERE status = 'running' ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let query = indoc! {r#"
            SELECT
                (SELECT COUNT(*) FROM jobs WHERE status = 'pending') AS pending,
                (SELECT COUNT(*) FROM jobs WHERE status = 'running') AS running,
                (SELECT COUNT(*) FROM jobs WHERE status = 'completed') AS completed,
                (SELECT COUNT(*) FROM jobs WHERE status = 'failed') AS failed,
                (SELECT COUNT(*) FROM workers WHERE status IN ('idle', 'busy')) AS online_workers,
                (SELECT COUNT(*) FROM workers WHERE status = 'busy') AS busy_workers
        "#};
        let (pending, running, completed, failed, online_workers, busy_workers): (
            i64,
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(query).fetch_one(&self.pool).await?;
        Ok(QueueStats {
            pending,
            running,
            completed,
            failed,
            online_workers,
            busy_workers,
        })
    }

    pub async fn leaderboard(&self, limit: i64) -> Result<Vec<LeaderboardEntry>> {
        let query = indoc! {r#"
            SELECT u.username AS username, u.credits AS credits,
                   COALESCE((SELECT SUM(w.jobs_completed) FROM workers w WHERE w.owner_id = u.id), 0)
                       AS jobs_completed
            FROM users u
            ORDER BY u.credits DESC, u.username ASC
            LIMIT ?
        "#};
        let rows = sqlx::query_as(query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}

async fn insert_ledger<'c, E>(
    exe: E,
    user_id: &str,
    delta: i64,
    kind: LedgerKind,
    job_id: Option<&str>,
    note: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let query = indoc! {r#"
        INSERT INTO credit_ledger (user_id, delta, kind, job_id, note, at)
        VALUES (?, ?, ?, ?, ?, ?)
    "#};
    sqlx::query(query)
        .bind(user_id)
        .bind(delta)
        .bind(kind)
        .bind(job_id)
        .bind(note)
        .bind(at)
        .execute(exe)
        .await?;
    Ok(())
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation)
}
