//! Submission API tests, driven through the real axum router.

mod test_harness;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use campus_grid::api::{router, ApiState};
use campus_grid::store::Role;
use test_harness::{specs, FakeWorker, TestCoordinator};

fn test_app(grid: &TestCoordinator) -> Router {
    router(ApiState {
        store: grid.store.clone(),
        registry: grid.registry.clone(),
        policy: grid.config.credits.clone(),
        limits: grid.config.limits.clone(),
    })
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header("x-user-id", user);
    }
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn demands_json(cpu: u32, ram: f64, gpu: bool, timeout: u32) -> Value {
    json!({
        "cpu_cores": cpu,
        "ram_gb": ram,
        "gpu_required": gpu,
        "timeout_seconds": timeout,
    })
}

#[tokio::test]
async fn user_creation_grants_the_starting_balance() {
    let grid = TestCoordinator::start().await;
    let app = test_app(&grid);

    let (status, body) = send(
        &app,
        "POST",
        "/api/users",
        None,
        Some(json!({"username": "alice", "password": "hunter2"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["balance"], 100);

    let user_id = body["user_id"].as_str().unwrap();
    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/users/{user_id}/balance"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 100);

    // Names are unique.
    let (status, _) = send(
        &app,
        "POST",
        "/api/users",
        None,
        Some(json!({"username": "alice", "password": "other"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn submission_needs_an_identity() {
    let grid = TestCoordinator::start().await;
    let app = test_app(&grid);

    let (status, _) = send(
        &app,
        "POST",
        "/api/jobs",
        None,
        Some(json!({
            "title": "t", "code": "print()",
            "demands": demands_json(1, 1.0, false, 60),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_costs_the_formula_price() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let app = test_app(&grid);

    let (status, body) = send(
        &app,
        "POST",
        "/api/cost",
        None,
        Some(json!({"demands": demands_json(1, 1.0, false, 60)})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cost"], 9);

    let (status, body) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(&alice.id),
        Some(json!({
            "title": "hello", "code": "print('hi')",
            "demands": demands_json(1, 1.0, false, 60),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["cost"], 9);
    assert_eq!(body["balance"], 91);

    let job_id = body["job_id"].as_str().unwrap().to_string();
    let (status, body) = send(
        &app,
        "GET",
        &format!("/api/jobs/{job_id}"),
        Some(&alice.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["credit_cost"], 9);

    let (status, body) = send(&app, "GET", "/api/jobs", Some(&alice.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

/// Scenario S2 through the API: rejected outright, nothing written.
#[tokio::test]
async fn submission_without_credits_is_rejected() {
    let grid = TestCoordinator::start().await;
    let bob = grid
        .store
        .create_user("bob", "password", Role::Submitter, 5)
        .await
        .unwrap();
    let app = test_app(&grid);

    let (status, _) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(&bob.id),
        Some(json!({
            "title": "broke", "code": "print()",
            "demands": demands_json(1, 1.0, false, 60),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);

    let (_, body) = send(&app, "GET", "/api/jobs", Some(&bob.id), None).await;
    assert_eq!(body.as_array().unwrap().len(), 0);
    let (_, body) = send(&app, "GET", &format!("/api/users/{}/balance", bob.id), None, None).await;
    assert_eq!(body["balance"], 5);
}

#[tokio::test]
async fn invalid_demands_are_rejected() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let app = test_app(&grid);

    for demands in [
        demands_json(0, 1.0, false, 60),
        demands_json(1, 0.0, false, 60),
        demands_json(1, 1.0, false, 0),
        demands_json(1, 1.0, false, 1_000_000),
    ] {
        let (status, _) = send(
            &app,
            "POST",
            "/api/jobs",
            Some(&alice.id),
            Some(json!({"title": "bad", "code": "x", "demands": demands})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "demands: {demands}");
    }
}

#[tokio::test]
async fn job_views_are_submitter_or_coordinator_only() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let peeker = grid.create_user("peeker", Role::Submitter).await;
    let admin = grid.create_user("admin", Role::Coordinator).await;
    let app = test_app(&grid);

    let (_, body) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(&alice.id),
        Some(json!({
            "title": "private", "code": "print()",
            "demands": demands_json(1, 1.0, false, 60),
        })),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, "GET", &format!("/api/jobs/{job_id}"), Some(&peeker.id), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, "GET", &format!("/api/jobs/{job_id}"), Some(&admin.id), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "GET", "/api/jobs/not-a-job", Some(&alice.id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_is_owner_only_and_one_shot() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let mallory = grid.create_user("mallory", Role::Submitter).await;
    let app = test_app(&grid);

    let (_, body) = send(
        &app,
        "POST",
        "/api/jobs",
        Some(&alice.id),
        Some(json!({
            "title": "cancel-me", "code": "print()",
            "demands": demands_json(1, 1.0, false, 60),
        })),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/jobs/{job_id}/cancel"),
        Some(&mallory.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        "POST",
        &format!("/api/jobs/{job_id}/cancel"),
        Some(&alice.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["balance"], 100);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/api/jobs/{job_id}/cancel"),
        Some(&alice.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn grants_are_coordinator_only() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let admin = grid.create_user("admin", Role::Coordinator).await;
    let app = test_app(&grid);

    let (status, _) = send(
        &app,
        "POST",
        "/api/admin/grant",
        Some(&alice.id),
        Some(json!({"user_id": alice.id, "delta": 1000, "reason": "self-serve"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        "POST",
        "/api/admin/grant",
        Some(&admin.id),
        Some(json!({"user_id": alice.id, "delta": 50, "reason": "hackathon prize"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 150);

    // Even admins cannot push a balance negative.
    let (status, _) = send(
        &app,
        "POST",
        "/api/admin/grant",
        Some(&admin.id),
        Some(json!({"user_id": alice.id, "delta": -1000, "reason": "clawback"})),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
}

#[tokio::test]
async fn stats_and_leaderboard_reflect_the_store() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let app = test_app(&grid);

    send(
        &app,
        "POST",
        "/api/jobs",
        Some(&alice.id),
        Some(json!({
            "title": "queued", "code": "print()",
            "demands": demands_json(1, 1.0, false, 60),
        })),
    )
    .await;

    let (status, body) = send(&app, "GET", "/api/stats", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], 1);
    assert_eq!(body["running"], 0);

    let (status, body) = send(&app, "GET", "/api/leaderboard", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["username"], "alice");
}

#[tokio::test]
async fn submitters_see_only_a_minimal_worker_view() {
    let grid = TestCoordinator::start().await;
    let alice = grid.create_user("alice", Role::Submitter).await;
    let owner = grid.create_user("owner", Role::WorkerOwner).await;
    let app = test_app(&grid);

    let _worker = FakeWorker::connect(
        grid.worker_addr,
        "lab-1",
        Some("owner"),
        specs(4, 8.0, None, true),
    )
    .await;

    let (status, body) = send(&app, "GET", "/api/workers", Some(&alice.id), None).await;
    assert_eq!(status, StatusCode::OK);
    let workers = body.as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["name"], "lab-1");
    assert!(workers[0].get("id").is_none(), "submitter view must not leak ids");
    assert!(workers[0].get("owner_id").is_none());

    let (status, body) = send(&app, "GET", "/api/workers", Some(&owner.id), None).await;
    assert_eq!(status, StatusCode::OK);
    let workers = body.as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert!(workers[0]["connected"].as_bool().unwrap());
    assert!(workers[0].get("id").is_some());
}
