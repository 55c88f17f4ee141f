//! Best-effort host spec detection for worker registration.

use std::time::Duration;

use tokio::process::Command;

use crate::protocol::WorkerSpecs;

/// Probe the host. `allow_docker` reflects the sandbox setting: a worker
/// that will not run containers must not advertise docker, or it would be
/// offered jobs it cannot isolate.
pub async fn detect_specs(allow_docker: bool) -> WorkerSpecs {
    WorkerSpecs {
        cpu_cores: cpu_cores(),
        ram_gb: total_ram_gb().unwrap_or(1.0),
        gpu_name: gpu_name().await,
        docker_available: allow_docker && docker_available().await,
        os_family: Some(std::env::consts::OS.to_string()),
    }
}

fn cpu_cores() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// MemTotal from /proc/meminfo, in GiB. `None` off Linux.
fn total_ram_gb() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kb / (1024.0 * 1024.0) * 100.0).round() / 100.0)
}

async fn gpu_name() -> Option<String> {
    let probe = Command::new("nvidia-smi")
        .args(["--query-gpu=name", "--format=csv,noheader"])
        .output();
    let output = tokio::time::timeout(Duration::from_secs(5), probe)
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    (!name.is_empty()).then_some(name)
}

async fn docker_available() -> bool {
    let probe = Command::new("docker").arg("info").output();
    match tokio::time::timeout(Duration::from_secs(5), probe).await {
        Ok(Ok(output)) => output.status.success(),
        _ => false,
    }
}
