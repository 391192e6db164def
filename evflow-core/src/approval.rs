//! Human Approval Coordinator (C4, spec.md §4.4).
//!
//! A registry of pending gates plus an observable stream of synthetic
//! decision events. Gates are durable records (kept around after
//! resolution so the REST surface in spec.md §6 can still answer `GET
//! /approvals/:gate_id` for an already-decided gate); only `GET /approvals`
//! filters to `status == pending`.

use crate::types::{ApprovalDecision, ApprovalFallback};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, RwLock};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateRecord {
    pub gate_id: String,
    pub instance_id: Uuid,
    pub machine_id: String,
    pub workflow_id: String,
    pub context_snapshot: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub status: GateStatus,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

#[derive(Debug)]
pub struct ResolveRequest {
    pub gate_id: String,
    pub decision: ApprovalDecision,
    pub decided_by: String,
    pub decided_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("gate not found: {0}")]
    NotFound(String),
    #[error("gate {0} is not pending")]
    NotPending(String),
}

/// Payload carried by the synthetic `human_approval` trigger event (spec.md §4.4/§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HumanApprovalPayload {
    pub gate_id: String,
    pub decision: ApprovalDecision,
    pub decided_by: Option<String>,
    pub comment: Option<String>,
    pub context_snapshot: serde_json::Value,
}

struct Entry {
    record: GateRecord,
    fallback: ApprovalFallback,
    timeout_cancel: Option<oneshot::Sender<()>>,
}

pub struct ApprovalCoordinator {
    gates: RwLock<HashMap<String, Entry>>,
    events: broadcast::Sender<crate::types::TriggerEvent>,
}

impl ApprovalCoordinator {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self { gates: RwLock::new(HashMap::new()), events: tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<crate::types::TriggerEvent> {
        self.events.subscribe()
    }

    /// Register a pending gate and schedule its timeout. Requires `Arc<Self>`
    /// since the timeout fires on a spawned task that may outlive the
    /// caller — every coordinator in this crate is constructed behind an
    /// `Arc` and shared between the FSM runtime and the REST surface.
    ///
    /// Notification dispatch itself is the caller's responsibility (the
    /// pipeline executor runs `notify_via` steps; this only registers the
    /// gate and arms its timer).
    pub async fn register_gate(
        self: &Arc<Self>,
        gate_id: &str,
        instance_id: Uuid,
        machine_id: &str,
        workflow_id: &str,
        context_snapshot: serde_json::Value,
        timeout_ms: u64,
        fallback: ApprovalFallback,
    ) {
        let record = GateRecord {
            gate_id: gate_id.to_string(),
            instance_id,
            machine_id: machine_id.to_string(),
            workflow_id: workflow_id.to_string(),
            context_snapshot,
            registered_at: Utc::now(),
            timeout_ms,
            status: GateStatus::Pending,
            decided_by: None,
            decided_at: None,
            comment: None,
        };

        let (cancel_tx, cancel_rx) = oneshot::channel();
        let gate_id_owned = gate_id.to_string();

        {
            let mut gates = self.gates.write().await;
            gates.insert(
                gate_id.to_string(),
                Entry { record, fallback, timeout_cancel: Some(cancel_tx) },
            );
        }

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                    this.fire_timeout(&gate_id_owned).await;
                }
                _ = cancel_rx => {
                    tracing::debug!(gate_id = %gate_id_owned, "approval: timer cancelled");
                }
            }
        });
    }

    async fn fire_timeout(&self, gate_id: &str) {
        let mut gates = self.gates.write().await;
        let Some(entry) = gates.get_mut(gate_id) else { return };
        if entry.record.status != GateStatus::Pending {
            return;
        }
        let effective_decision = match entry.fallback {
            ApprovalFallback::TimedOut => ApprovalDecision::TimedOut,
            ApprovalFallback::TreatAsRejected => ApprovalDecision::Rejected,
        };
        entry.record.status = GateStatus::TimedOut;
        entry.record.decided_at = Some(Utc::now());
        let payload = HumanApprovalPayload {
            gate_id: gate_id.to_string(),
            decision: effective_decision,
            decided_by: None,
            comment: None,
            context_snapshot: entry.record.context_snapshot.clone(),
        };
        let event = build_trigger_event(&entry.record.workflow_id, &payload);
        drop(gates);
        let _ = self.events.send(event);
    }

    /// Resolve a pending gate with a human decision. Errors if the gate is
    /// unknown or already resolved (spec.md §8 boundary behaviour).
    pub async fn resolve(&self, req: ResolveRequest) -> Result<(), GateError> {
        let mut gates = self.gates.write().await;
        let entry = gates.get_mut(&req.gate_id).ok_or_else(|| GateError::NotFound(req.gate_id.clone()))?;
        if entry.record.status != GateStatus::Pending {
            return Err(GateError::NotPending(req.gate_id.clone()));
        }
        if let Some(tx) = entry.timeout_cancel.take() {
            let _ = tx.send(());
        }
        entry.record.status = match req.decision {
            ApprovalDecision::Approved => GateStatus::Approved,
            ApprovalDecision::Rejected => GateStatus::Rejected,
            ApprovalDecision::TimedOut => GateStatus::TimedOut,
        };
        entry.record.decided_by = Some(req.decided_by.clone());
        entry.record.decided_at = Some(req.decided_at.unwrap_or_else(Utc::now));
        entry.record.comment = req.comment.clone();

        let payload = HumanApprovalPayload {
            gate_id: req.gate_id.clone(),
            decision: req.decision,
            decided_by: Some(req.decided_by),
            comment: req.comment,
            context_snapshot: entry.record.context_snapshot.clone(),
        };
        let event = build_trigger_event(&entry.record.workflow_id, &payload);
        drop(gates);
        let _ = self.events.send(event);
        Ok(())
    }

    /// Cancel a pending gate without emitting a decision event (used for
    /// `DELETE /approvals/:gate_id` and FSM reset).
    pub async fn cancel_gate(&self, gate_id: &str) -> Result<(), GateError> {
        let mut gates = self.gates.write().await;
        let entry = gates.get_mut(gate_id).ok_or_else(|| GateError::NotFound(gate_id.to_string()))?;
        if entry.record.status != GateStatus::Pending {
            return Err(GateError::NotPending(gate_id.to_string()));
        }
        if let Some(tx) = entry.timeout_cancel.take() {
            let _ = tx.send(());
        }
        entry.record.status = GateStatus::Cancelled;
        Ok(())
    }

    /// Cancel every pending gate for an instance (FSM reset, spec.md §4.10).
    pub async fn cancel_all_for_instance(&self, instance_id: Uuid) {
        let mut gates = self.gates.write().await;
        for entry in gates.values_mut() {
            if entry.record.instance_id == instance_id && entry.record.status == GateStatus::Pending {
                if let Some(tx) = entry.timeout_cancel.take() {
                    let _ = tx.send(());
                }
                entry.record.status = GateStatus::Cancelled;
            }
        }
    }

    pub async fn pending(&self) -> Vec<GateRecord> {
        let gates = self.gates.read().await;
        gates.values().filter(|e| e.record.status == GateStatus::Pending).map(|e| e.record.clone()).collect()
    }

    pub async fn summary(&self) -> (usize, usize) {
        let gates = self.gates.read().await;
        let total = gates.len();
        let pending = gates.values().filter(|e| e.record.status == GateStatus::Pending).count();
        (pending, total)
    }

    pub async fn get(&self, gate_id: &str) -> Option<GateRecord> {
        let gates = self.gates.read().await;
        gates.get(gate_id).map(|e| e.record.clone())
    }
}

impl Default for ApprovalCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn build_trigger_event(workflow_id: &str, payload: &HumanApprovalPayload) -> crate::types::TriggerEvent {
    crate::types::TriggerEvent {
        event_id: Uuid::new_v4(),
        occurred_at: Utc::now(),
        driver_id: "human_approval".to_string(),
        workflow_id: workflow_id.to_string(),
        workflow_version: 0,
        payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
        source: Some("approval_coordinator".to_string()),
    }
}
