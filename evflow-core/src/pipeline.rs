//! Pipeline Executor (C8, spec.md §4.8).
//!
//! Executes a compiled `Vec<PipelineStep>` against a triggering
//! `PropagatedEvent`, honouring retry, dry-run, branches, bounded loops,
//! approval gates, and the mandatory-write partitioning that guarantees
//! audit-trail writes regardless of how the regular set fared.

use crate::approval::{ApprovalCoordinator, HumanApprovalPayload, ResolveRequest};
use crate::compiler;
use crate::connector::ConnectorDispatcher;
use crate::multi_llm;
use crate::sandbox;
use crate::templates::dot_path;
use crate::types::{
    ApprovalDecision, ApprovalFallback, BranchStep, CallHttpStep, ConnectorActionStep, CrmQueryStep, DynamicSlot,
    HumanApprovalGateStep, LlmCallSpec, LogStep, LoopContextEnrichment, LoopStep, MlScoreCallStep, MultiLlmPipelineStep,
    OnMaxIterations, PipelineContext, PipelineResult, PipelineStep, PropagatedEvent, SendEmailStep, SlotSourceType,
    StepResult, StepStatus, WriteCrmStep,
};
use crate::llm;
use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

static RAW_HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

pub struct PipelineExecutor {
    connectors: Arc<ConnectorDispatcher>,
    approvals: Arc<ApprovalCoordinator>,
}

impl PipelineExecutor {
    pub fn new(connectors: Arc<ConnectorDispatcher>, approvals: Arc<ApprovalCoordinator>) -> Self {
        Self { connectors, approvals }
    }

    /// Execute `steps` against `event`. `pipeline_id` is used only for
    /// tracing/correlation; it carries no runtime semantics. A descriptor
    /// that fails `compiler::verify_pipeline` never runs — the semantic
    /// error is logged and the whole pipeline is recorded as `failed`
    /// (spec.md §7).
    pub async fn execute(&self, steps: &[PipelineStep], event: PropagatedEvent, pipeline_id: Option<&str>) -> PipelineContext {
        let mut ctx = PipelineContext::new(event);

        if let Err(errors) = compiler::verify_pipeline(steps) {
            tracing::error!(?errors, pipeline_id, "pipeline: descriptor failed validation, not executing");
            ctx.result = PipelineResult::Failed;
            return ctx;
        }

        let (mandatory, regular): (Vec<&PipelineStep>, Vec<&PipelineStep>) = steps.iter().partition(|s| s.is_mandatory_write());

        let mut regular_failed = false;
        for step in &regular {
            let ok = self.execute_step(step, &mut ctx).await;
            if !ok && !step.base().continue_on_failure {
                regular_failed = true;
                break;
            }
        }
        ctx.result = if regular_failed { PipelineResult::Failed } else { PipelineResult::Success };

        for step in &mandatory {
            // Mandatory writes always run; failures are logged, never rethrown,
            // and never flip `result` back to success/failed (spec.md §4.8 step 3).
            let _ = self.execute_step(step, &mut ctx).await;
        }

        ctx
    }

    /// Dispatch one step, writing exactly one `StepResult` for its id
    /// (spec.md §8 invariant 4/5). Returns whether the step succeeded
    /// (skips and dry-runs count as success for halt purposes).
    async fn execute_step(&self, step: &PipelineStep, ctx: &mut PipelineContext) -> bool {
        let base = step.base();
        let id = base.id.clone();

        if let Some(gate_id) = &base.requires_approval_gate_id {
            let approved = ctx
                .pipeline
                .get(gate_id)
                .and_then(|r| r.output.as_ref())
                .and_then(|o| o.get("decision"))
                .and_then(Value::as_str)
                == Some("approved");
            if !approved {
                ctx.pipeline.insert(
                    id,
                    StepResult {
                        status: StepStatus::Skipped,
                        output: Some(serde_json::json!({ "skippedReason": format!("gate_not_approved:{gate_id}") })),
                        error: None,
                        duration_ms: 0,
                    },
                );
                return true;
            }
        }

        if base.dry_run {
            ctx.pipeline.insert(
                id,
                StepResult {
                    status: StepStatus::Success,
                    output: Some(serde_json::json!({
                        "dry_run": true,
                        "step_type": step_kind_name(step),
                        "description": base.description,
                    })),
                    error: None,
                    duration_ms: 0,
                },
            );
            return true;
        }

        let started = Instant::now();
        let outcome = self.dispatch_with_retry(step, ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(output) => {
                let status = if matches!(step, PipelineStep::HumanApprovalGate(_))
                    && output.get("decision").and_then(Value::as_str) == Some("waiting_approval")
                {
                    StepStatus::WaitingApproval
                } else {
                    StepStatus::Success
                };
                ctx.pipeline.insert(id, StepResult { status, output: Some(output), error: None, duration_ms });
                true
            }
            Err(error) => {
                tracing::warn!(step_id = %base.id, %error, "pipeline: step failed");
                ctx.pipeline.insert(id, StepResult { status: StepStatus::Failed, output: None, error: Some(error.to_string()), duration_ms });
                base.continue_on_failure
            }
        }
    }

    async fn dispatch_with_retry(&self, step: &PipelineStep, ctx: &mut PipelineContext) -> anyhow::Result<Value> {
        let policy = step.base().retry_policy.clone();
        let max_attempts = policy.as_ref().map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            match self.dispatch_step(step, ctx).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    last_err = Some(error);
                    if attempt < max_attempts {
                        if let Some(p) = &policy {
                            let backoff = (p.backoff_ms as f64 * p.backoff_multiplier.powi(attempt as i32 - 1)) as u64;
                            tokio::time::sleep(Duration::from_millis(backoff)).await;
                        }
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("step `{}` produced no result", step.id())))
    }

    async fn dispatch_step(&self, step: &PipelineStep, ctx: &mut PipelineContext) -> anyhow::Result<Value> {
        match step {
            PipelineStep::LlmCall(s) => {
                let scope = ctx.as_scope();
                let resolved = resolve_dynamic_slots(&s.llm_context.dynamic_slots, &scope);
                let spec = LlmCallSpec { instruction_id: s.base.id.clone(), llm_context: s.llm_context.clone() };
                let result = llm::call(&spec, &resolved, &ctx.event.workflow_id).await;
                result.parsed.ok_or_else(|| anyhow::anyhow!(result.error.unwrap_or_else(|| "llm call produced no output".to_string())))
            }
            PipelineStep::Loop(s) => self.dispatch_loop(s, ctx).await,
            PipelineStep::MlScoreCall(s) => self.dispatch_ml_score(s, &ctx.as_scope()).await,
            PipelineStep::CrmQuery(s) => self.dispatch_crm_query(s, &ctx.as_scope()).await,
            PipelineStep::Branch(s) => self.dispatch_branch(s, ctx).await,
            PipelineStep::HumanApprovalGate(s) => self.dispatch_gate(s, ctx).await,
            PipelineStep::SendEmail(s) => self.dispatch_send_email(s, &ctx.as_scope()).await,
            PipelineStep::WriteCrm(s) => self.dispatch_write_crm(s, &ctx.as_scope()).await,
            PipelineStep::Alert(s) => self.dispatch_alert(s, &ctx.as_scope()).await,
            PipelineStep::CallHttp(s) => self.dispatch_call_http(s, &ctx.as_scope()).await,
            PipelineStep::Log(s) => self.dispatch_log(s, &ctx.as_scope()).await,
            PipelineStep::ConnectorAction(s) => self.dispatch_connector_action(s, &ctx.as_scope()).await,
            PipelineStep::MultiLlmPipeline(s) => self.dispatch_multi_llm(s, ctx).await,
        }
    }

    async fn dispatch_loop(&self, s: &LoopStep, ctx: &mut PipelineContext) -> anyhow::Result<Value> {
        let deadline = Instant::now() + Duration::from_millis(s.timeout_ms);
        let mut scratch = ctx.clone();
        let mut best: Option<Value> = None;
        let mut best_score = f64::NEG_INFINITY;
        let mut latest = Value::Null;
        let mut converged = false;

        for _ in 0..s.max_iterations {
            if Instant::now() >= deadline {
                break;
            }

            if s.context_enrichment == LoopContextEnrichment::AppendPrevious {
                let synthetic_id = format!("{}_previous", s.base.id);
                scratch.pipeline.insert(
                    synthetic_id,
                    StepResult { status: StepStatus::Success, output: Some(latest.clone()), error: None, duration_ms: 0 },
                );
            }

            for inner in &s.body {
                self.execute_step(inner, &mut scratch).await;
            }

            latest = s.body.last().and_then(|b| scratch.pipeline.get(b.id())).and_then(|r| r.output.clone()).unwrap_or(Value::Null);

            if let Some(score) = dot_path(&latest, &s.best_output_field).and_then(Value::as_f64) {
                if best.is_none() || score > best_score {
                    best_score = score;
                    best = Some(latest.clone());
                }
            }

            let predicate_scope = serde_json::json!({ "output": latest });
            if sandbox::evaluate_bool(&s.convergence_predicate, &predicate_scope, None).await {
                converged = true;
                break;
            }
        }

        if converged {
            return Ok(serde_json::json!({
                "best_output": best.unwrap_or_else(|| latest.clone()),
                "final_output": latest,
            }));
        }

        match s.on_max_iterations {
            OnMaxIterations::UseBestAttempt => Ok(serde_json::json!({
                "best_output": best.unwrap_or_else(|| latest.clone()),
                "final_output": latest,
            })),
            OnMaxIterations::Fail => {
                Err(anyhow::anyhow!("loop step `{}` exhausted {} iterations without converging", s.base.id, s.max_iterations))
            }
        }
    }

    async fn dispatch_ml_score(&self, s: &MlScoreCallStep, scope: &Value) -> anyhow::Result<Value> {
        match (&s.connector_id, &s.principal_id) {
            (Some(connector_id), Some(principal_id)) => {
                let result = self.connectors.dispatch(connector_id, principal_id, "score", &s.slots, &BTreeMap::new(), scope).await?;
                Ok(result.raw_response)
            }
            _ => Ok(serde_json::json!({ "score": 0.0, "stub": true })),
        }
    }

    async fn dispatch_crm_query(&self, s: &CrmQueryStep, scope: &Value) -> anyhow::Result<Value> {
        let result = self.connectors.dispatch(&s.connector_id, &s.principal_id, "record.fetch", &s.slots, &s.extract_output, scope).await?;
        Ok(serde_json::json!({ "raw_response": result.raw_response, "extracted": result.extracted }))
    }

    async fn dispatch_branch(&self, s: &BranchStep, ctx: &mut PipelineContext) -> anyhow::Result<Value> {
        let condition = sandbox::evaluate_bool(&s.condition, &ctx.as_scope(), None).await;
        let chosen = if condition { &s.if_true } else { &s.if_false };

        for inner in chosen {
            self.execute_step(inner, ctx).await;
        }

        let result: Vec<Value> = chosen
            .iter()
            .map(|inner| {
                let status = ctx.pipeline.get(inner.id()).map(|r| format!("{:?}", r.status)).unwrap_or_default();
                serde_json::json!({ "step_id": inner.id(), "status": status })
            })
            .collect();

        Ok(serde_json::json!({ "condition": condition, "result": result }))
    }

    async fn dispatch_gate(&self, s: &HumanApprovalGateStep, ctx: &mut PipelineContext) -> anyhow::Result<Value> {
        let scope = ctx.as_scope();
        let mut snapshot = Map::new();
        for path in &s.context_source_paths {
            if let Some(v) = dot_path(&scope, path) {
                snapshot.insert(path.clone(), v.clone());
            }
        }
        let context_snapshot = Value::Object(snapshot);

        for inner in &s.notify_via {
            // Failures here never abort the gate (spec.md §4.8).
            self.execute_step(inner, ctx).await;
        }

        self.approvals
            .register_gate(&s.gate_id, ctx.event.event_id, &ctx.event.machine_id, &ctx.event.workflow_id, context_snapshot, s.timeout_ms, ApprovalFallback::TimedOut)
            .await;

        let mut rx = self.approvals.subscribe();
        let hard_timeout = Duration::from_millis(s.timeout_ms + 5_000);
        let gate_id = s.gate_id.clone();

        let matched = tokio::time::timeout(hard_timeout, async {
            loop {
                match rx.recv().await {
                    Ok(event) if event.payload.get("gate_id").and_then(Value::as_str) == Some(gate_id.as_str()) => return Some(event),
                    Ok(_) => continue,
                    Err(_) => return None,
                }
            }
        })
        .await;

        let Ok(Some(decision_event)) = matched else {
            // The coordinator's own timer always fires before this grace
            // window elapses; reaching here means the event channel closed.
            return Ok(serde_json::json!({ "gate_id": s.gate_id, "decision": "waiting_approval" }));
        };

        let payload: HumanApprovalPayload = serde_json::from_value(decision_event.payload.clone())?;
        let decision_str = match payload.decision {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
            ApprovalDecision::TimedOut => "timed_out",
        };

        match payload.decision {
            ApprovalDecision::Approved => {
                for inner in &s.on_approved {
                    self.execute_step(inner, ctx).await;
                }
            }
            ApprovalDecision::Rejected => {
                for inner in &s.on_rejected {
                    self.execute_step(inner, ctx).await;
                }
            }
            // spec.md S3: on timeout neither on_approved nor on_rejected run
            // unless a fallback strategy maps timeout onto rejected (not
            // configured here).
            ApprovalDecision::TimedOut => {}
        }

        Ok(serde_json::json!({
            "gate_id": s.gate_id,
            "decision": decision_str,
            "decided_by": payload.decided_by,
            "comment": payload.comment,
        }))
    }

    async fn dispatch_send_email(&self, s: &SendEmailStep, scope: &Value) -> anyhow::Result<Value> {
        let to = sandbox::render_template(&s.to_template, scope, None).await;
        let subject = sandbox::render_template(&s.subject_template, scope, None).await;
        let body = sandbox::render_template(&s.body_template, scope, None).await;
        let payload = serde_json::json!({ "to": to, "subject": subject, "body": body });
        let result = self.connectors.dispatch_with_body(&s.connector_id, &s.principal_id, "email.send", payload, &BTreeMap::new()).await?;
        Ok(result.raw_response)
    }

    async fn dispatch_write_crm(&self, s: &WriteCrmStep, scope: &Value) -> anyhow::Result<Value> {
        let result = self.connectors.dispatch(&s.connector_id, &s.principal_id, "record.create", &s.slots, &BTreeMap::new(), scope).await?;
        Ok(result.raw_response)
    }

    async fn dispatch_alert(&self, s: &crate::types::AlertStep, scope: &Value) -> anyhow::Result<Value> {
        let message = sandbox::render_template(&s.message_template, scope, None).await;
        tracing::warn!(severity = %s.severity, %message, "pipeline: alert");
        Ok(serde_json::json!({ "message": message, "severity": s.severity }))
    }

    async fn dispatch_call_http(&self, s: &CallHttpStep, scope: &Value) -> anyhow::Result<Value> {
        let url = sandbox::render_template(&s.url_template, scope, None).await;
        let method = reqwest::Method::from_bytes(s.method.to_uppercase().as_bytes()).unwrap_or(reqwest::Method::GET);
        let mut request = RAW_HTTP_CLIENT.request(method, &url);
        if let Some(template) = &s.body_template {
            request = request.body(sandbox::render_template(template, scope, None).await);
        }
        let response = request.send().await.map_err(|e| anyhow::anyhow!("call_http transport error: {e}"))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("call_http upstream {}: {}", status.as_u16(), text);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    async fn dispatch_log(&self, s: &LogStep, scope: &Value) -> anyhow::Result<Value> {
        let message = sandbox::render_template(&s.message_template, scope, None).await;
        tracing::info!(%message, "pipeline: log step");
        Ok(serde_json::json!({ "message": message }))
    }

    async fn dispatch_connector_action(&self, s: &ConnectorActionStep, scope: &Value) -> anyhow::Result<Value> {
        let result = self.connectors.dispatch(&s.connector_id, &s.principal_id, &s.action, &s.slots, &s.extract_output, scope).await?;
        Ok(serde_json::json!({ "raw_response": result.raw_response, "extracted": result.extracted }))
    }

    async fn dispatch_multi_llm(&self, s: &MultiLlmPipelineStep, ctx: &PipelineContext) -> anyhow::Result<Value> {
        let result = multi_llm::run(&s.pipeline, &ctx.as_scope(), &ctx.event.workflow_id).await;
        Ok(serde_json::to_value(result)?)
    }
}

/// Resolve a pipeline step's dynamic slots against `{pipeline, event}`.
/// `PreviousStageOutput` only has meaning inside a multi-LLM pipeline (C7);
/// outside that context it resolves to `null`.
fn resolve_dynamic_slots(slots: &[DynamicSlot], scope: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    for slot in slots {
        let resolved = match slot.source_type {
            SlotSourceType::Runtime | SlotSourceType::Vault => dot_path(scope, &slot.source_key).cloned().unwrap_or(Value::Null),
            SlotSourceType::PreviousStageOutput => Value::Null,
        };
        out.insert(slot.slot_id.clone(), resolved);
    }
    out
}

fn step_kind_name(step: &PipelineStep) -> &'static str {
    match step {
        PipelineStep::LlmCall(_) => "llm_call",
        PipelineStep::Loop(_) => "loop",
        PipelineStep::MlScoreCall(_) => "ml_score_call",
        PipelineStep::CrmQuery(_) => "crm_query",
        PipelineStep::Branch(_) => "branch",
        PipelineStep::HumanApprovalGate(_) => "human_approval_gate",
        PipelineStep::SendEmail(_) => "send_email",
        PipelineStep::WriteCrm(_) => "write_crm",
        PipelineStep::Alert(_) => "alert",
        PipelineStep::CallHttp(_) => "call_http",
        PipelineStep::Log(_) => "log",
        PipelineStep::ConnectorAction(_) => "connector_action",
        PipelineStep::MultiLlmPipeline(_) => "multi_llm_pipeline",
    }
}
