//! Whole-system tests: a real coordinator and the real worker client,
//! executing jobs in restricted mode with `sh` as the interpreter.

mod test_harness;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use campus_grid::config::{SandboxConfig, WorkerConfig};
use campus_grid::store::{JobStatus, Role, Store};
use campus_grid::worker::run_worker;
use test_harness::{assert_eventually, demands, TestCoordinator};

fn shell_worker_config(grid: &TestCoordinator, name: &str, owner: Option<&str>) -> WorkerConfig {
    WorkerConfig {
        manager_addr: grid.worker_addr.to_string(),
        name: name.to_string(),
        owner_token: owner.map(String::from),
        heartbeat_interval: Duration::from_millis(300),
        poll_interval: Duration::from_millis(100),
        sandbox: SandboxConfig {
            enabled: false,
            fallback_command: "sh".to_string(),
            ..SandboxConfig::default()
        },
        ..WorkerConfig::default()
    }
}

async fn wait_for_status(store: &Store, job_id: &str, wanted: JobStatus, secs: u64) {
    let store = store.clone();
    let job_id = job_id.to_string();
    assert_eventually(
        || {
            let store = store.clone();
            let job_id = job_id.clone();
            async move { store.get_job(&job_id).await.unwrap().unwrap().status == wanted }
        },
        Duration::from_secs(secs),
        &format!("job should reach {wanted}"),
    )
    .await;
}

#[tokio::test]
async fn a_real_worker_completes_a_job_and_earns_credits() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let owner = grid.create_user("owner", Role::WorkerOwner).await;

    let cancel = CancellationToken::new();
    let config = shell_worker_config(&grid, "real-worker", Some("owner"));
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move { run_worker(config, worker_cancel).await });

    let job = grid
        .submit_code(
            &alice,
            "greeting",
            "echo hello from the grid",
            demands(1, 0.5, false, 60),
            5,
        )
        .await;
    assert_eq!(job.credit_cost, 9);

    wait_for_status(&grid.store, &job.id, JobStatus::Completed, 10).await;

    let settled = grid.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(settled.stdout.as_deref(), Some("hello from the grid\n"));
    assert_eq!(settled.ran_sandboxed, Some(false));
    assert_eq!(grid.store.balance(&owner.id).await.unwrap(), 109);
    assert_eq!(grid.store.balance(&alice.id).await.unwrap(), 91);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
}

#[tokio::test]
async fn a_failing_job_settles_failed_without_refund() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;

    let cancel = CancellationToken::new();
    let config = shell_worker_config(&grid, "fail-worker", None);
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move { run_worker(config, worker_cancel).await });

    let job = grid
        .submit_code(&alice, "broken", "exit 7", demands(1, 0.5, false, 60), 5)
        .await;

    wait_for_status(&grid.store, &job.id, JobStatus::Failed, 10).await;

    let settled = grid.store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(settled.error_reason.as_deref(), Some("exit status 7"));
    // Cost stays spent on a plain failure.
    assert_eq!(grid.store.balance(&alice.id).await.unwrap(), 91);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
}

#[tokio::test]
async fn a_sleeping_job_is_timed_out_by_the_worker() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;

    let cancel = CancellationToken::new();
    let config = shell_worker_config(&grid, "timeout-worker", None);
    let worker_cancel = cancel.clone();
    let worker = tokio::spawn(async move { run_worker(config, worker_cancel).await });

    // timeout_seconds = 1, payload sleeps far longer
    let job = grid
        .submit_code(&alice, "sleeper", "sleep 30", demands(1, 0.5, false, 1), 5)
        .await;

    wait_for_status(&grid.store, &job.id, JobStatus::TimedOut, 15).await;

    // Half the cost back, rounded down: 9 -> 4.
    assert_eq!(grid.store.balance(&alice.id).await.unwrap(), 95);

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), worker).await;
}

#[tokio::test]
async fn two_workers_drain_a_queue_without_double_assignment() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for name in ["drain-a", "drain-b"] {
        let config = shell_worker_config(&grid, name, None);
        let worker_cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_worker(config, worker_cancel).await
        }));
    }

    let mut job_ids = Vec::new();
    for i in 0..6 {
        let job = grid
            .submit_code(
                &alice,
                &format!("batch-{i}"),
                &format!("echo {i}"),
                demands(1, 0.5, false, 60),
                5,
            )
            .await;
        job_ids.push(job.id);
    }

    for job_id in &job_ids {
        wait_for_status(&grid.store, job_id, JobStatus::Completed, 20).await;
    }

    // Every job ran exactly once on exactly one worker.
    for (i, job_id) in job_ids.iter().enumerate() {
        let job = grid.store.get_job(job_id).await.unwrap().unwrap();
        assert!(job.worker_id.is_some());
        assert_eq!(job.stdout.as_deref(), Some(format!("{i}\n").as_str()));
    }

    cancel.cancel();
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
}
