//! End-to-end seed scenarios not already covered by inline `#[cfg(test)]`
//! modules (S1/S2/S4 live beside `fsm.rs`/`pipeline.rs`; this file covers
//! S3, S5, and S6, which need a human decision round-trip, a scripted
//! multi-call score sequence, and a full dry-run pass respectively).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use evflow_core::approval::{ApprovalCoordinator, ResolveRequest};
use evflow_core::connector::{ConnectorDispatcher, MemoryCredentialProvider, MemoryIntegrationRegistry};
use evflow_core::pipeline::PipelineExecutor;
use evflow_core::types::*;
use uuid::Uuid;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn base(id: &str) -> StepBase {
    StepBase { id: id.to_string(), description: None, continue_on_failure: false, dry_run: false, retry_policy: None, requires_approval_gate_id: None }
}

fn event() -> PropagatedEvent {
    PropagatedEvent {
        event_id: Uuid::new_v4(),
        machine_id: "m1".to_string(),
        source_node_id: None,
        workflow_id: "wf1".to_string(),
        timestamp: Utc::now(),
        satisfaction_level: 1.0,
        matched_values: Default::default(),
        time_window: TimeWindow { started_at: Utc::now(), completed_at: Utc::now(), window_ms: 1000, remaining_ms: 0 },
        local_actions_taken: vec![],
        precursor_signals: vec![],
        signature: None,
    }
}

fn executor(approvals: Arc<ApprovalCoordinator>) -> PipelineExecutor {
    let registry = Arc::new(MemoryIntegrationRegistry::new());
    let credentials = Arc::new(MemoryCredentialProvider::new());
    PipelineExecutor::new(Arc::new(ConnectorDispatcher::new(registry, credentials)), approvals)
}

// ─── S3 — approval gate ─────────────────────────────────────────────────

fn gate_pipeline(gate_id: &str, timeout_ms: u64) -> Vec<PipelineStep> {
    vec![
        PipelineStep::HumanApprovalGate(HumanApprovalGateStep {
            base: base("G"),
            gate_id: gate_id.to_string(),
            timeout_ms,
            context_source_paths: vec![],
            notify_via: vec![],
            on_approved: vec![PipelineStep::SendEmail(SendEmailStep {
                base: StepBase { dry_run: true, ..base("E") },
                connector_id: "ghost_mail".to_string(),
                principal_id: "p1".to_string(),
                to_template: "a@b.com".to_string(),
                subject_template: "approved".to_string(),
                body_template: "body".to_string(),
            })],
            on_rejected: vec![PipelineStep::Log(LogStep { base: base("L"), message_template: "rejected".to_string() })],
        }),
    ]
}

#[tokio::test]
async fn s3_approval_within_timeout_runs_on_approved_branch() {
    let approvals = Arc::new(ApprovalCoordinator::new());
    let exec = executor(approvals.clone());

    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        approvals
            .resolve(ResolveRequest { gate_id: "G".to_string(), decision: ApprovalDecision::Approved, decided_by: "alice".to_string(), decided_at: None, comment: None })
            .await
            .expect("gate resolves");
    });

    let ctx = exec.execute(&gate_pipeline("G", 5_000), event(), None).await;
    assert_eq!(ctx.pipeline["G"].output.as_ref().unwrap()["decision"], "approved");
    assert_eq!(ctx.pipeline["E"].status, StepStatus::Success);
    assert!(!ctx.pipeline.contains_key("L"));
}

#[tokio::test]
async fn s3_no_decision_times_out_and_skips_both_branches() {
    let approvals = Arc::new(ApprovalCoordinator::new());
    let exec = executor(approvals);
    let ctx = exec.execute(&gate_pipeline("G2", 50), event(), None).await;

    assert_eq!(ctx.pipeline["G"].output.as_ref().unwrap()["decision"], "timed_out");
    assert!(!ctx.pipeline.contains_key("E"));
    assert!(!ctx.pipeline.contains_key("L"));
}

// ─── S5 — loop convergence ──────────────────────────────────────────────

/// Returns scores 0.5, 0.7, 0.85 on successive calls, then keeps returning
/// the last one. Grounded on the scripted-responder pattern used for the
/// connector framework's retry tests in the wider example pack.
struct SequentialScores {
    calls: AtomicUsize,
    scores: Vec<f64>,
}

impl Respond for SequentialScores {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let i = self.calls.fetch_add(1, Ordering::SeqCst).min(self.scores.len() - 1);
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "score": self.scores[i] }))
    }
}

#[tokio::test]
async fn s5_loop_exits_at_third_iteration_with_best_output() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(SequentialScores { calls: AtomicUsize::new(0), scores: vec![0.5, 0.7, 0.85] })
        .mount(&mock_server)
        .await;

    let mut registry = MemoryIntegrationRegistry::new();
    registry.register(evflow_core::connector::Integration {
        connector_id: "scorer".to_string(),
        kind: evflow_core::connector::IntegrationKind::GenericRest,
        base_url: mock_server.uri(),
        timeout_ms: 2_000,
    });
    let mut credentials = MemoryCredentialProvider::new();
    credentials.register("scorer", "p1", BTreeMap::new());

    let approvals = Arc::new(ApprovalCoordinator::new());
    let exec = PipelineExecutor::new(Arc::new(ConnectorDispatcher::new(Arc::new(registry), Arc::new(credentials))), approvals);

    let steps = vec![PipelineStep::Loop(LoopStep {
        base: base("scoring_loop"),
        body: vec![PipelineStep::MlScoreCall(MlScoreCallStep {
            base: base("score_call"),
            connector_id: Some("scorer".to_string()),
            principal_id: Some("p1".to_string()),
            slots: BTreeMap::new(),
        })],
        max_iterations: 5,
        timeout_ms: 10_000,
        context_enrichment: LoopContextEnrichment::None,
        convergence_predicate: "output.score > 0.8".to_string(),
        best_output_field: "score".to_string(),
        on_max_iterations: OnMaxIterations::UseBestAttempt,
    })];

    let ctx = exec.execute(&steps, event(), None).await;

    assert_eq!(ctx.pipeline["scoring_loop"].status, StepStatus::Success);
    let output = ctx.pipeline["scoring_loop"].output.as_ref().unwrap();
    assert_eq!(output["best_output"]["score"], 0.85);
    assert_eq!(output["final_output"]["score"], 0.85);
}

// ─── S6 — dry run ───────────────────────────────────────────────────────

#[tokio::test]
async fn s6_dry_run_never_calls_the_connector() {
    let approvals = Arc::new(ApprovalCoordinator::new());
    let exec = executor(approvals);

    let steps = vec![PipelineStep::ConnectorAction(ConnectorActionStep {
        base: StepBase { dry_run: true, description: Some("create ticket".to_string()), ..base("A") },
        connector_id: "ghost_crm".to_string(),
        principal_id: "p1".to_string(),
        action: "ticket.create".to_string(),
        slots: BTreeMap::new(),
        extract_output: BTreeMap::new(),
    })];

    let ctx = exec.execute(&steps, event(), None).await;

    assert_eq!(ctx.pipeline["A"].status, StepStatus::Success);
    let output = ctx.pipeline["A"].output.as_ref().unwrap();
    assert_eq!(output["dry_run"], true);
    assert_eq!(output["step_type"], "connector_action");
    assert_eq!(output["description"], "create ticket");
}
