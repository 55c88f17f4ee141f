//! Wire message types for the coordinator <-> worker protocol.
//!
//! Every frame body is a single JSON object with a `type` discriminator.
//! Deserialization is strict: an unknown `type` or a missing required field
//! fails to parse, and the session handling the frame closes.

use serde::{Deserialize, Serialize};

/// Hardware profile a worker reports at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpecs {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub docker_available: bool,
    /// OS family tag, e.g. "linux". Absent means the worker matches any
    /// job's tag requirement.
    #[serde(default)]
    pub os_family: Option<String>,
}

/// Resource profile a job requires from a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDemands {
    pub cpu_cores: u32,
    pub ram_gb: f64,
    #[serde(default)]
    pub gpu_required: bool,
    #[serde(default)]
    pub docker_required: bool,
    /// Required OS family; absent is a wildcard.
    #[serde(default)]
    pub os_family: Option<String>,
    pub timeout_seconds: u32,
}

/// Terminal outcome a worker reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    TimedOut,
}

/// One output file produced by a job, base64-encoded for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub name: String,
    pub bytes_b64: String,
}

/// Worker status as reported in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Idle,
    Busy,
}

/// Messages a worker sends to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Must be the first message of a session.
    Register {
        name: String,
        #[serde(default)]
        owner_token: Option<String>,
        specs: WorkerSpecs,
    },
    Heartbeat {
        worker_id: String,
        status: ReportedStatus,
    },
    RequestJob {
        worker_id: String,
    },
    JobResult {
        job_id: String,
        outcome: JobOutcome,
        /// Failure classification: "oom", "dependency", "timeout", an exit
        /// code, etc.
        #[serde(default)]
        reason: Option<String>,
        stdout: String,
        stderr: String,
        #[serde(default)]
        files: Vec<ArtifactFile>,
        /// False when the job ran in the restricted fallback mode; recorded
        /// with the result for audit.
        #[serde(default = "default_sandboxed")]
        sandboxed: bool,
    },
    Disconnect {},
}

fn default_sandboxed() -> bool {
    true
}

/// Messages the coordinator sends to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    Registered {
        worker_id: String,
    },
    Job {
        job_id: String,
        title: String,
        code: String,
        #[serde(default)]
        requirements: Option<String>,
        cpu_cores: u32,
        ram_gb: f64,
        timeout_seconds: u32,
        credit_reward: i64,
    },
    NoJob {},
    JobReceived {
        job_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_round_trips_with_type_tag() {
        let msg = WorkerMessage::Register {
            name: "lab-3".to_string(),
            owner_token: Some("alice".to_string()),
            specs: WorkerSpecs {
                cpu_cores: 4,
                ram_gb: 8.0,
                gpu_name: None,
                docker_available: true,
                os_family: Some("linux".to_string()),
            },
        };

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "register");
        assert_eq!(json["specs"]["cpu_cores"], 4);

        let back: WorkerMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<WorkerMessage>(r#"{"type":"shutdown_everything"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        // register without specs
        let err = serde_json::from_str::<WorkerMessage>(r#"{"type":"register","name":"w"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn owner_token_defaults_to_anonymous() {
        let msg: WorkerMessage = serde_json::from_str(
            r#"{"type":"register","name":"w","specs":{"cpu_cores":1,"ram_gb":1.0}}"#,
        )
        .unwrap();
        match msg {
            WorkerMessage::Register { owner_token, specs, .. } => {
                assert!(owner_token.is_none());
                assert!(!specs.docker_available);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
