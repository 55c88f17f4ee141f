//! In-memory view of the workers currently connected.
//!
//! One entry per live session. The store remains the source of truth for
//! durable worker state; on coordinator restart this map starts empty and the
//! reaper restores the job/worker invariants. Entries are mutated only after
//! the corresponding store transaction has committed.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{CoordinatorMessage, ReportedStatus, WorkerSpecs};
use crate::store::WorkerStatus;

/// A connected worker session.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub specs: WorkerSpecs,
    pub status: WorkerStatus,
    pub assigned_job: Option<String>,
    pub last_heartbeat: Instant,
    /// Bounded outbound channel drained by the session's writer task.
    pub outbound: mpsc::Sender<CoordinatorMessage>,
}

/// Registry snapshot entry, safe to hand to the API layer.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub specs: WorkerSpecs,
    pub status: WorkerStatus,
    pub assigned_job: Option<String>,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session after its register transaction committed. A reconnect
    /// under the same worker id replaces the stale entry; dropping the old
    /// outbound sender ends the old writer task.
    pub async fn attach(&self, entry: WorkerEntry) {
        let mut workers = self.workers.write().await;
        if workers.insert(entry.worker_id.clone(), entry).is_some() {
            tracing::debug!("Replaced stale registry entry on reconnect");
        }
    }

    /// Record a heartbeat. The reported status may flip idle<->busy, but a
    /// coordinator-side `busy` from an assignment in flight is never
    /// overridden by a stale `idle` report.
    pub async fn heartbeat(&self, worker_id: &str, reported: ReportedStatus) -> bool {
        let mut workers = self.workers.write().await;
        let Some(entry) = workers.get_mut(worker_id) else {
            return false;
        };
        entry.last_heartbeat = Instant::now();
        if entry.assigned_job.is_none() {
            entry.status = match reported {
                ReportedStatus::Idle => WorkerStatus::Idle,
                ReportedStatus::Busy => WorkerStatus::Busy,
            };
        }
        true
    }

    pub async fn mark_busy(&self, worker_id: &str, job_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(worker_id) {
            entry.status = WorkerStatus::Busy;
            entry.assigned_job = Some(job_id.to_string());
        }
    }

    pub async fn mark_idle(&self, worker_id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(worker_id) {
            entry.status = WorkerStatus::Idle;
            entry.assigned_job = None;
        }
    }

    /// Remove a session, returning its entry. The caller marks the worker
    /// offline in the store; any job still assigned is handled by the reaper
    /// after the grace period, since the worker may reconnect and deliver.
    pub async fn detach(&self, worker_id: &str) -> Option<WorkerEntry> {
        self.workers.write().await.remove(worker_id)
    }

    pub async fn contains(&self, worker_id: &str) -> bool {
        self.workers.read().await.contains_key(worker_id)
    }

    /// Specs and current status, for the scheduler's assignment path.
    pub async fn specs_and_status(
        &self,
        worker_id: &str,
    ) -> Option<(WorkerSpecs, WorkerStatus)> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|e| (e.specs.clone(), e.status))
    }

    pub async fn sender(&self, worker_id: &str) -> Option<mpsc::Sender<CoordinatorMessage>> {
        self.workers
            .read()
            .await
            .get(worker_id)
            .map(|e| e.outbound.clone())
    }

    pub async fn snapshot(&self) -> Vec<WorkerView> {
        let workers = self.workers.read().await;
        let mut views: Vec<WorkerView> = workers
            .values()
            .map(|e| WorkerView {
                worker_id: e.worker_id.clone(),
                name: e.name.clone(),
                owner_id: e.owner_id.clone(),
                specs: e.specs.clone(),
                status: e.status,
                assigned_job: e.assigned_job.clone(),
            })
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}
