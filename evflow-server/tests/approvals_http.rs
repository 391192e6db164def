//! HTTP-level integration tests for the approval REST surface (spec.md §6).
//!
//! Grounded on the teacher's `authoring_http_integration.rs`: build the
//! router in-process and drive it with `tower::ServiceExt::oneshot`, no
//! real socket involved.

use std::sync::Arc;

use axum::body::Body;
use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use evflow_core::approval::ApprovalCoordinator;
use evflow_core::connector::{ConnectorDispatcher, MemoryCredentialProvider, MemoryIntegrationRegistry};
use evflow_core::dispatcher::PropagatedEventDispatcher;
use evflow_core::fsm::EventStateMachineRuntime;
use evflow_core::ingress::NullEmitter;
use evflow_core::pipeline::PipelineExecutor;
use evflow_core::store_memory::MemoryFsmStateStore;
use evflow_core::window::WindowManager;
use evflow_server::router::build_router;
use evflow_server::state::AppState;

fn test_app() -> (axum::Router, Arc<ApprovalCoordinator>) {
    let approvals = Arc::new(ApprovalCoordinator::new());
    let connectors = Arc::new(ConnectorDispatcher::new(Arc::new(MemoryIntegrationRegistry::new()), Arc::new(MemoryCredentialProvider::new())));
    let pipeline_executor = Arc::new(PipelineExecutor::new(connectors.clone(), approvals.clone()));
    let remote_emitter = Arc::new(NullEmitter);
    let dispatcher = Arc::new(PropagatedEventDispatcher::new(pipeline_executor, connectors.clone(), remote_emitter.clone()));
    let runtime = Arc::new(EventStateMachineRuntime::new(
        Arc::new(MemoryFsmStateStore::new()),
        Arc::new(WindowManager::new()),
        approvals.clone(),
        dispatcher,
        remote_emitter,
        connectors,
        None,
    ));
    let state = AppState { approvals: approvals.clone(), runtime };
    (build_router(state), approvals)
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (app, _) = test_app();
    let resp = app.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_gate_returns_404() {
    let (app, _) = test_app();
    let resp = app.oneshot(Request::builder().uri("/approvals/ghost").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn approve_then_get_reflects_decision() {
    let (app, approvals) = test_app();

    approvals
        .register_gate("G", uuid::Uuid::new_v4(), "m1", "wf1", json!({"amount": 500}), 60_000, evflow_core::types::ApprovalFallback::TimedOut)
        .await;

    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/approvals/G")
                .header("content-type", "application/json")
                .body(Body::from(json!({"decision": "APPROVED", "decided_by": "alice"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["decision"], "APPROVED");

    let resp = app.oneshot(Request::builder().uri("/approvals/G").body(Body::empty()).unwrap()).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["status"], "approved");
    assert_eq!(body["decided_by"], "alice");
}

#[tokio::test]
async fn resolving_an_already_decided_gate_is_rejected() {
    let (app, approvals) = test_app();
    approvals.register_gate("G", uuid::Uuid::new_v4(), "m1", "wf1", json!({}), 60_000, evflow_core::types::ApprovalFallback::TimedOut).await;
    approvals
        .resolve(evflow_core::approval::ResolveRequest {
            gate_id: "G".to_string(),
            decision: evflow_core::types::ApprovalDecision::Rejected,
            decided_by: "bob".to_string(),
            decided_at: None,
            comment: None,
        })
        .await
        .unwrap();

    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/approvals/G")
                .header("content-type", "application/json")
                .body(Body::from(json!({"decision": "APPROVED", "decided_by": "alice"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_removes_pending_gate_without_decision() {
    let (app, approvals) = test_app();
    approvals.register_gate("G", uuid::Uuid::new_v4(), "m1", "wf1", json!({}), 60_000, evflow_core::types::ApprovalFallback::TimedOut).await;

    let resp = app
        .clone()
        .oneshot(Request::builder().method("DELETE").uri("/approvals/G").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    assert_eq!(approvals.pending().await.len(), 0);
}
