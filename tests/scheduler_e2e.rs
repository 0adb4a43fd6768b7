//! End-to-end scheduler scenarios against a fake in-VM agent, covering the
//! register/invoke/delete flows and the warm-pool-of-one concurrency case
//! described in spec.md §8 "End-to-end scenarios".

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};

use faasd_control_plane::agent::{DispatchPayload, ResultCallback};
use faasd_control_plane::config::HypervisorSettings;
use faasd_control_plane::db::Db;
use faasd_control_plane::reconciler::Reconciler;
use faasd_control_plane::registry::FunctionRegistry;
use faasd_control_plane::scheduler::{InvocationResult, Scheduler, SchedulerSettings};
use faasd_control_plane::vm::{FakeHypervisor, VmPoolManager};

#[derive(Clone)]
struct FakeAgentState {
    reconciler: Arc<Reconciler>,
}

/// Stands in for the in-VM agent: accepts a dispatch, "runs" a trivial
/// greet-style handler over the event payload, and reports the result back
/// through the reconciler directly (skipping the HTTP hop back to the
/// control plane's own `/api/results`, which is exercised separately in
/// the API-layer tests).
async fn fake_execute(
    State(state): State<FakeAgentState>,
    Json(payload): Json<DispatchPayload>,
) -> StatusCode {
    tokio::spawn(async move {
        let name = payload.event.get("name").and_then(|v| v.as_str()).unwrap_or("world");
        let output = serde_json::json!({ "hi": name }).to_string();
        let report = ResultCallback {
            request_id: payload.request_id,
            function_id: payload.function_id,
            status_code: 200,
            output: Some(output),
            error_message: None,
            duration_ms: 5,
            memory_usage_kb: None,
        };
        let _ = state.reconciler.receive_result(report).await;
    });
    StatusCode::ACCEPTED
}

async fn spawn_fake_agent(reconciler: Arc<Reconciler>, addr: SocketAddr) {
    let app = Router::new()
        .route("/execute", post(fake_execute))
        .with_state(FakeAgentState { reconciler });
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind fake agent");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    // Give the listener a moment to start accepting before the scheduler dispatches.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}

/// Each test gets its own loopback /24 so fake agents bound to the
/// deterministic first-allocated address (`<net>.1:8081`) never collide
/// across concurrently-running tests.
async fn harness(
    network_octet: u8,
    warm_pool_size: usize,
) -> (Arc<Scheduler>, Arc<FunctionRegistry>, Arc<Reconciler>, Db) {
    let db = Db::connect_in_memory().await.unwrap();
    let hv_settings = HypervisorSettings {
        binary_path: "/bin/true".into(),
        kernel_image_path: "/dev/null".into(),
        rootfs_image_path: "/dev/null".into(),
        working_dir_base: std::env::temp_dir(),
        default_vcpu_count: 1,
        default_mem_size_mib: 128,
        boot_timeout_secs: 5,
        use_fake_hypervisor: true,
    };
    let cidr = (std::net::Ipv4Addr::new(127, 0, network_octet, 0), 24);
    let pool = VmPoolManager::new(db.clone(), Arc::new(FakeHypervisor), hv_settings, warm_pool_size, cidr);

    let registry = FunctionRegistry::new(db.clone());
    let scheduler_settings = SchedulerSettings {
        async_queue_capacity: 10,
        async_worker_count: 2,
        sync_poll_interval_ms: 50,
        sync_poll_max_attempts: 60,
        timeout_monitor_threshold_secs: 300,
    };
    let scheduler = Scheduler::new(db.clone(), pool, registry.clone(), scheduler_settings);
    let reconciler = Reconciler::new(db.clone());

    let agent_addr: SocketAddr = format!("127.0.{network_octet}.1:8081").parse().unwrap();
    spawn_fake_agent(reconciler.clone(), agent_addr).await;

    (scheduler, registry, reconciler, db)
}

#[tokio::test]
async fn sync_invocation_returns_greet_output() {
    let (scheduler, registry, _reconciler, _db) = harness(10, 2).await;
    let function = registry
        .register(
            "greet".into(),
            "python3.9".into(),
            128,
            30,
            "def handler(e, c): return {\"hi\": e.get(\"name\", \"world\")}".into(),
            None,
            None,
        )
        .await
        .unwrap();

    let result = scheduler
        .schedule(function.id, serde_json::json!({ "name": "Ada" }), None, true)
        .await
        .unwrap();

    match result {
        InvocationResult::Terminal(execution) => {
            assert_eq!(execution.status, faasd_control_plane::models::ExecutionStatus::Completed);
            let output: serde_json::Value = serde_json::from_str(&execution.output.unwrap()).unwrap();
            assert_eq!(output["hi"], "Ada");
            assert!(execution.duration_ms.unwrap() >= 0);
        }
        other => panic!("expected a terminal result, got {other:?}"),
    }
}

#[tokio::test]
async fn async_invocation_reaches_same_terminal_state_as_sync() {
    let (scheduler, registry, _reconciler, db) = harness(11, 2).await;
    let function = registry
        .register(
            "greet-async".into(),
            "python3.9".into(),
            128,
            30,
            "def handler(e, c): return {\"hi\": e.get(\"name\", \"world\")}".into(),
            None,
            None,
        )
        .await
        .unwrap();

    scheduler.spawn_workers();
    let accepted = scheduler
        .schedule(function.id, serde_json::json!({ "name": "Grace" }), None, false)
        .await
        .unwrap();

    let execution_id = match accepted {
        InvocationResult::Accepted { execution_id } => execution_id,
        other => panic!("expected Accepted, got {other:?}"),
    };

    let mut execution = db.get_execution(execution_id).await.unwrap();
    for _ in 0..60 {
        if execution.status.is_terminal() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        execution = db.get_execution(execution_id).await.unwrap();
    }

    assert_eq!(execution.status, faasd_control_plane::models::ExecutionStatus::Completed);
    let output: serde_json::Value = serde_json::from_str(&execution.output.unwrap()).unwrap();
    assert_eq!(output["hi"], "Grace");
}

#[tokio::test]
async fn deleted_function_is_not_found_by_name() {
    let (scheduler, registry, _reconciler, _db) = harness(12, 2).await;
    let function = registry
        .register("transient".into(), "python3.9".into(), 128, 30, "def handler(e,c): pass".into(), None, None)
        .await
        .unwrap();
    registry.delete(function.id).await.unwrap();

    let err = scheduler
        .schedule_by_name("transient", serde_json::json!({}), None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, faasd_control_plane::scheduler::SchedulerError::FunctionNotFound));
}

#[tokio::test]
async fn warm_pool_of_one_serves_two_concurrent_sync_invocations() {
    let (scheduler, registry, reconciler, _db) = harness(13, 1).await;
    // Two concurrent leases against an empty pool each create their own VM
    // (spec.md §4.1 `lease`: only `return` is pool-bounded), so a second
    // fake agent listener covers the second address the allocator hands
    // out before either invocation has a chance to return its VM.
    let second_agent_addr: SocketAddr = "127.0.13.2:8081".parse().unwrap();
    spawn_fake_agent(reconciler, second_agent_addr).await;

    let function = registry
        .register(
            "greet-w1".into(),
            "python3.9".into(),
            128,
            30,
            "def handler(e, c): return {\"hi\": e.get(\"name\", \"world\")}".into(),
            None,
            None,
        )
        .await
        .unwrap();

    let a = scheduler.schedule(function.id, serde_json::json!({ "name": "A" }), None, true);
    let b = scheduler.schedule(function.id, serde_json::json!({ "name": "B" }), None, true);
    let (a, b) = tokio::join!(a, b);

    for result in [a.unwrap(), b.unwrap()] {
        match result {
            InvocationResult::Terminal(execution) => {
                assert_eq!(execution.status, faasd_control_plane::models::ExecutionStatus::Completed);
            }
            other => panic!("expected a terminal result, got {other:?}"),
        }
    }
}
