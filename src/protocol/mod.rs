//! Coordinator <-> worker wire protocol: message shapes and framing.

pub mod codec;
pub mod message;

pub use codec::{read_message, write_message};
pub use message::{
    ArtifactFile, CoordinatorMessage, JobDemands, JobOutcome, ReportedStatus, WorkerMessage,
    WorkerSpecs,
};
