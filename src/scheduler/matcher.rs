//! Demand matching and the credit cost formula.

use crate::protocol::{JobDemands, WorkerSpecs};

/// Whether a worker's reported specs satisfy a job's demands.
///
/// A missing OS tag on the job is a wildcard; a present tag must be matched
/// exactly by the worker.
pub fn demands_satisfied(demands: &JobDemands, specs: &WorkerSpecs) -> bool {
    if specs.cpu_cores < demands.cpu_cores {
        return false;
    }
    if specs.ram_gb < demands.ram_gb {
        return false;
    }
    if demands.gpu_required && specs.gpu_name.as_deref().map_or(true, str::is_empty) {
        return false;
    }
    if demands.docker_required && !specs.docker_available {
        return false;
    }
    if let Some(required) = &demands.os_family {
        if specs.os_family.as_ref() != Some(required) {
            return false;
        }
    }
    true
}

/// Credit cost of a job:
/// `5 + 2*cpu + ceil(ram_gb) + 10*gpu + ceil(timeout/60)`.
/// The reward equals the cost.
pub fn job_cost(demands: &JobDemands) -> i64 {
    let base = 5;
    let cpu = 2 * demands.cpu_cores as i64;
    let ram = demands.ram_gb.ceil() as i64;
    let gpu = if demands.gpu_required { 10 } else { 0 };
    let minutes = (demands.timeout_seconds as i64 + 59) / 60;
    base + cpu + ram + gpu + minutes
}
