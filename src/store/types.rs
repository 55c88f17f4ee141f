//! Row types and enumerations persisted by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::{JobDemands, WorkerSpecs};

/// Implements TEXT-backed sqlx storage for a unit enum that exposes
/// `as_str` / `parse`.
macro_rules! sqlite_text_enum {
    ($ty:ty) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $ty {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <&str as sqlx::Type<sqlx::Sqlite>>::type_info()
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut <sqlx::Sqlite as sqlx::Database>::ArgumentBuffer<'q>,
            ) -> std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.as_str(), buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $ty {
            fn decode(
                value: <sqlx::Sqlite as sqlx::Database>::ValueRef<'r>,
            ) -> std::result::Result<Self, sqlx::error::BoxDynError> {
                let s: &str = sqlx::Decode::<sqlx::Sqlite>::decode(value)?;
                <$ty>::parse(s).ok_or_else(|| format!("invalid {}: {s:?}", stringify!($ty)).into())
            }
        }
    };
}

/// Job lifecycle state.
///
/// Transitions are monotonic: `pending -> running -> terminal`, with
/// `pending -> cancelled` as the only shortcut.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

sqlite_text_enum!(JobStatus);

/// Durable worker state. `idle` and `busy` describe a connected worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

sqlite_text_enum!(WorkerStatus);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    WorkerOwner,
    Submitter,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordinator => "coordinator",
            Self::WorkerOwner => "worker_owner",
            Self::Submitter => "submitter",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coordinator" => Some(Self::Coordinator),
            "worker_owner" => Some(Self::WorkerOwner),
            "submitter" => Some(Self::Submitter),
            _ => None,
        }
    }
}

sqlite_text_enum!(Role);

/// Ledger entry classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    SignupGrant,
    JobDebit,
    JobCredit,
    AdminAdjust,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SignupGrant => "signup_grant",
            Self::JobDebit => "job_debit",
            Self::JobCredit => "job_credit",
            Self::AdminAdjust => "admin_adjust",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "signup_grant" => Some(Self::SignupGrant),
            "job_debit" => Some(Self::JobDebit),
            "job_credit" => Some(Self::JobCredit),
            "admin_adjust" => Some(Self::AdminAdjust),
            _ => None,
        }
    }
}

sqlite_text_enum!(LedgerKind);

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password_verifier: String,
    pub role: Role,
    pub credits: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkerRow {
    pub id: String,
    pub name: String,
    pub owner_id: Option<String>,
    pub status: WorkerStatus,
    pub cpu_cores: i64,
    pub ram_gb: f64,
    pub gpu_name: Option<String>,
    pub docker_available: bool,
    pub os_family: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub jobs_completed: i64,
    pub credits_earned: i64,
    pub created_at: DateTime<Utc>,
}

impl WorkerRow {
    pub fn specs(&self) -> WorkerSpecs {
        WorkerSpecs {
            cpu_cores: self.cpu_cores as u32,
            ram_gb: self.ram_gb,
            gpu_name: self.gpu_name.clone(),
            docker_available: self.docker_available,
            os_family: self.os_family.clone(),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub title: String,
    pub submitter_id: String,
    pub worker_id: Option<String>,
    pub status: JobStatus,
    pub priority: i64,
    pub code: String,
    pub requirements: Option<String>,
    pub cpu_cores: i64,
    pub ram_gb: f64,
    pub gpu_required: bool,
    pub docker_required: bool,
    pub os_family: Option<String>,
    pub timeout_seconds: i64,
    pub credit_cost: i64,
    pub credit_reward: i64,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error_reason: Option<String>,
    /// JSON array of [`ArtifactMeta`].
    pub artifacts: Option<String>,
    pub ran_sandboxed: Option<bool>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    pub fn demands(&self) -> JobDemands {
        JobDemands {
            cpu_cores: self.cpu_cores as u32,
            ram_gb: self.ram_gb,
            gpu_required: self.gpu_required,
            docker_required: self.docker_required,
            os_family: self.os_family.clone(),
            timeout_seconds: self.timeout_seconds as u32,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LedgerRow {
    pub id: i64,
    pub user_id: String,
    pub delta: i64,
    pub kind: LedgerKind,
    pub job_id: Option<String>,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Name and size of one stored artifact, kept on the job row; the bytes live
/// under the artifacts directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub name: String,
    pub size: u64,
}

/// Network-wide counters for the stats view.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub online_workers: i64,
    pub busy_workers: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LeaderboardEntry {
    pub username: String,
    pub credits: i64,
    pub jobs_completed: i64,
}
