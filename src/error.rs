use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("frame of {got} bytes exceeds the {max} byte limit")]
    OversizedFrame { got: usize, max: usize },

    #[error("peer closed the connection")]
    ConnectionClosed,

    #[error("insufficient credits: need {needed}, have {available}")]
    InsufficientCredits { needed: i64, available: i64 },

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("job {0} is not pending")]
    NotPending(String),

    #[error("job {0} is not running")]
    NotRunning(String),

    #[error("permission denied")]
    Forbidden,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GridError>;
