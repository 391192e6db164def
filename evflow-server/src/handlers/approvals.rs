//! REST approval surface (spec.md §6, C4 boundary).
//!
//! - `GET /approvals` — pending gates only.
//! - `GET /approvals/summary` — `{pending, total}`.
//! - `GET /approvals/:gate_id` — full record, 404 if unknown.
//! - `POST /approvals/:gate_id` — human decision.
//! - `DELETE /approvals/:gate_id` — cancellation, no decision event.

use axum::{
    extract::{Extension, Path},
    Json,
};
use chrono::{DateTime, Utc};
use evflow_core::approval::ResolveRequest;
use evflow_core::error::EngineError;
use evflow_core::types::ApprovalDecision;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::AppError;
use crate::state::AppState;

pub async fn list_pending(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!(state.approvals.pending().await))
}

pub async fn summary(Extension(state): Extension<AppState>) -> Json<Value> {
    let (pending, total) = state.approvals.summary().await;
    Json(json!({"pending": pending, "total": total}))
}

pub async fn get_gate(Extension(state): Extension<AppState>, Path(gate_id): Path<String>) -> Result<Json<Value>, AppError> {
    let gate = state.approvals.get(&gate_id).await.ok_or_else(|| EngineError::NotFound(format!("gate not found: {gate_id}")))?;
    Ok(Json(json!(gate)))
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub decision: String,
    pub decided_by: String,
    pub comment: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

fn parse_decision(raw: &str) -> Result<ApprovalDecision, EngineError> {
    match raw.to_ascii_uppercase().as_str() {
        "APPROVED" => Ok(ApprovalDecision::Approved),
        "REJECTED" => Ok(ApprovalDecision::Rejected),
        "TIMED_OUT" | "TIMEDOUT" => Ok(ApprovalDecision::TimedOut),
        other => Err(EngineError::InvalidInput(format!("unknown decision: {other}"))),
    }
}

pub async fn resolve_gate(
    Extension(state): Extension<AppState>,
    Path(gate_id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> Result<Json<Value>, AppError> {
    if body.decided_by.trim().is_empty() {
        return Err(EngineError::InvalidInput("decided_by is required".to_string()).into());
    }
    let decision = parse_decision(&body.decision)?;

    state
        .approvals
        .resolve(ResolveRequest {
            gate_id: gate_id.clone(),
            decision,
            decided_by: body.decided_by,
            decided_at: body.decided_at,
            comment: body.comment,
        })
        .await?;

    Ok(Json(json!({"ok": true, "gate_id": gate_id, "decision": body.decision})))
}

pub async fn cancel_gate(Extension(state): Extension<AppState>, Path(gate_id): Path<String>) -> Result<Json<Value>, AppError> {
    state.approvals.cancel_gate(&gate_id).await?;
    Ok(Json(json!({"ok": true, "gate_id": gate_id})))
}
