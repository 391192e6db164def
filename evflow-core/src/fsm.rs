//! Event State Machine Runtime (C10, spec.md §4.10).
//!
//! Deploys FSM descriptors, consumes trigger events (general bus + C4's
//! synthetic approval stream), evaluates transitions, executes on-entry
//! actions, and emits propagated events through an injected `EventSink`
//! (C9 in production; the interface boundary exists to break the C9/C10
//! cycle, spec.md §9). Instance processing is serialized per machine via a
//! single `RwLock` over that machine's instance map — a coarser grain than
//! literal per-instance locking, but it keeps the hot path simple and still
//! gives parallel-across-machines execution; condition evaluation itself is
//! bounded by the sandbox's own timeout, so a slow condition stalls its
//! sibling instances for at most that long.

use crate::approval::ApprovalCoordinator;
use crate::compiler;
use crate::connector::ConnectorDispatcher;
use crate::error::ConnectorError;
use crate::ingress::{EventSink, RemoteCommandEmitter};
use crate::llm;
use crate::sandbox;
use crate::signature;
use crate::store::FsmStateStore;
use crate::templates::{dot_path, resolve_slots};
use crate::trends;
use crate::types::{
    ApprovalGateOnEntry, ConditionDescriptor, DynamicSlot, EventStateMachineDescriptor, FsmRuntimeState, Guard,
    LlmCallSpec, LocalActionTaken, MatchedValue, OnEntryAction, ParallelFetchAction, PendingApprovalGate, PropagatedEvent,
    RemoteCommand, SlotSourceType, StepCallSpec, TimeWindow, Transition, TriggerEvent,
};
use crate::window::{ExpiryCallback, WindowManager};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, RwLock};
use uuid::Uuid;

struct Deployed {
    workflow_id: String,
    descriptor: EventStateMachineDescriptor,
    instances: RwLock<HashMap<Uuid, FsmRuntimeState>>,
}

pub struct EventStateMachineRuntime {
    deployed: RwLock<HashMap<String, Arc<Deployed>>>,
    store: Arc<dyn FsmStateStore>,
    windows: Arc<WindowManager>,
    approvals: Arc<ApprovalCoordinator>,
    event_sink: Arc<dyn EventSink>,
    remote_emitter: Arc<dyn RemoteCommandEmitter>,
    connectors: Arc<ConnectorDispatcher>,
    hmac_key: Option<Vec<u8>>,
}

impl EventStateMachineRuntime {
    pub fn new(
        store: Arc<dyn FsmStateStore>,
        windows: Arc<WindowManager>,
        approvals: Arc<ApprovalCoordinator>,
        event_sink: Arc<dyn EventSink>,
        remote_emitter: Arc<dyn RemoteCommandEmitter>,
        connectors: Arc<ConnectorDispatcher>,
        hmac_key: Option<Vec<u8>>,
    ) -> Self {
        Self {
            deployed: RwLock::new(HashMap::new()),
            store,
            windows,
            approvals,
            event_sink,
            remote_emitter,
            connectors,
            hmac_key,
        }
    }

    /// Drives the runtime off two broadcast streams until `shutdown` flips
    /// true, mirroring the teacher's listener `tokio::select!` shutdown
    /// pattern.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: broadcast::Receiver<TriggerEvent>,
        mut approval_events: broadcast::Receiver<TriggerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                event = triggers.recv() => {
                    match event {
                        Ok(event) => self.handle_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "fsm: trigger bus lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                event = approval_events.recv() => {
                    match event {
                        Ok(event) => self.handle_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "fsm: approval bus lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub async fn deploy_fsm(self: &Arc<Self>, workflow_id: &str, descriptor: EventStateMachineDescriptor) {
        if let Err(errors) = compiler::verify_fsm(&descriptor) {
            tracing::error!(?errors, workflow_id, machine_id = %descriptor.machine_id, "fsm: descriptor failed validation, not deployed");
            return;
        }

        let machine_id = descriptor.machine_id.clone();

        if let Some(target) = descriptor.target_node_id.clone() {
            let command = RemoteCommand {
                command_id: Uuid::new_v4(),
                command: "deploy_fsm".to_string(),
                params: Value::Null,
                source_event_id: None,
                source_machine_id: Some(machine_id.clone()),
                deploy_fsm: Some(descriptor.clone()),
            };
            if let Err(error) = self.remote_emitter.emit(&target, command).await {
                tracing::warn!(%error, machine_id, "fsm: remote deploy_fsm dispatch failed");
            }
        }

        let deployed = Arc::new(Deployed { workflow_id: workflow_id.to_string(), descriptor, instances: RwLock::new(HashMap::new()) });
        self.deployed.write().await.insert(machine_id, deployed);
    }

    pub async fn undeploy_workflow(&self, workflow_id: &str) {
        let removed: Vec<Arc<Deployed>> = {
            let mut deployed = self.deployed.write().await;
            let to_remove: Vec<String> =
                deployed.iter().filter(|(_, d)| d.workflow_id == workflow_id).map(|(k, _)| k.clone()).collect();
            to_remove.into_iter().filter_map(|k| deployed.remove(&k)).collect()
        };
        for d in removed {
            let instance_ids: Vec<Uuid> = d.instances.read().await.keys().copied().collect();
            for instance_id in instance_ids {
                self.windows.cancel_window(instance_id).await;
                self.approvals.cancel_all_for_instance(instance_id).await;
            }
        }
    }

    pub async fn get_instance(&self, machine_id: &str, instance_id: Uuid) -> Option<FsmRuntimeState> {
        let deployed = self.deployed.read().await.get(machine_id).cloned()?;
        deployed.instances.read().await.get(&instance_id).cloned()
    }

    pub async fn list_instances(&self, machine_id: &str) -> Vec<FsmRuntimeState> {
        match self.deployed.read().await.get(machine_id).cloned() {
            Some(d) => d.instances.read().await.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    pub async fn handle_event(self: &Arc<Self>, event: &TriggerEvent) {
        let snapshot: Vec<Arc<Deployed>> = self.deployed.read().await.values().cloned().collect();
        for deployed in snapshot {
            let subscribed = &deployed.descriptor.subscribed_driver_ids;
            if !subscribed.is_empty() && !subscribed.contains(&event.driver_id) {
                continue;
            }

            let instance_ids: Vec<Uuid> = deployed.instances.read().await.keys().copied().collect();
            for instance_id in instance_ids {
                self.process_existing_instance(&deployed, instance_id, event).await;
            }
            self.try_start_new_instance(&deployed, event).await;
        }
    }

    async fn process_existing_instance(self: &Arc<Self>, deployed: &Arc<Deployed>, instance_id: Uuid, event: &TriggerEvent) {
        let (current_state, step_outputs) = {
            let instances = deployed.instances.read().await;
            let Some(instance) = instances.get(&instance_id) else { return };
            (instance.current_state.clone(), instance.step_outputs.clone())
        };

        let mut candidates: Vec<&Transition> = deployed
            .descriptor
            .transitions
            .iter()
            .filter(|t| t.from_states.iter().any(|s| s == &current_state) && t.guard != Guard::WindowElapsed)
            .collect();
        candidates.sort_by_key(|t| t.priority);

        for transition in candidates {
            if !condition_matches(&transition.condition, event, &step_outputs).await {
                continue;
            }
            if transition.guard == Guard::WithinWindow && !self.windows.is_window_active(instance_id).await {
                continue;
            }
            self.fire_transition(deployed, instance_id, transition, event).await;
            return;
        }
    }

    async fn try_start_new_instance(self: &Arc<Self>, deployed: &Arc<Deployed>, event: &TriggerEvent) {
        let mut candidates: Vec<&Transition> = deployed
            .descriptor
            .transitions
            .iter()
            .filter(|t| t.from_states.iter().any(|s| s == &deployed.descriptor.initial_state))
            .collect();
        candidates.sort_by_key(|t| t.priority);

        for transition in candidates {
            if !condition_matches(&transition.condition, event, &BTreeMap::new()).await {
                continue;
            }
            let instance = FsmRuntimeState::new(
                &deployed.descriptor.machine_id,
                &deployed.workflow_id,
                deployed.descriptor.target_node_id.clone(),
                &deployed.descriptor.initial_state,
            );
            let instance_id = instance.instance_id;
            deployed.instances.write().await.insert(instance_id, instance);
            self.fire_transition(deployed, instance_id, transition, event).await;
            return;
        }
    }

    async fn fire_transition(self: &Arc<Self>, deployed: &Arc<Deployed>, instance_id: Uuid, transition: &Transition, event: &TriggerEvent) {
        let snapshot = {
            let mut instances = deployed.instances.write().await;
            let Some(instance) = instances.get_mut(&instance_id) else { return };
            instance.current_state = transition.to_state.clone();
            instance.last_transition_at = Utc::now();
            if let Some(value) = extract_matched_value(&transition.condition, event) {
                instance
                    .matched_values
                    .insert(transition.condition.metric_name().to_string(), MatchedValue { value, unit: None, timestamp: Utc::now() });
            }
            instance.clone()
        };

        self.store.save(&snapshot).await;
        self.run_on_entry(deployed, instance_id, &transition.on_entry).await;
    }

    async fn handle_window_expiry(self: &Arc<Self>, machine_id: &str, instance_id: Uuid) {
        let Some(deployed) = self.deployed.read().await.get(machine_id).cloned() else { return };
        let Some(previous_state) = deployed.instances.read().await.get(&instance_id).map(|i| i.current_state.clone()) else { return };

        {
            let mut instances = deployed.instances.write().await;
            if let Some(instance) = instances.get_mut(&instance_id) {
                instance.current_state = deployed.descriptor.expired_state.clone();
                instance.last_transition_at = Utc::now();
            }
        }

        let on_entries: Vec<OnEntryAction> = deployed
            .descriptor
            .transitions
            .iter()
            .filter(|t| t.guard == Guard::WindowElapsed && t.from_states.iter().any(|s| s == &previous_state))
            .flat_map(|t| t.on_entry.iter().cloned())
            .collect();

        for action in &on_entries {
            self.run_one_on_entry(&deployed, instance_id, action).await;
        }

        self.reset_instance(&deployed, instance_id).await;
    }

    async fn run_on_entry(self: &Arc<Self>, deployed: &Arc<Deployed>, instance_id: Uuid, actions: &[OnEntryAction]) {
        for action in actions {
            self.run_one_on_entry(deployed, instance_id, action).await;
        }
    }

    async fn run_one_on_entry(self: &Arc<Self>, deployed: &Arc<Deployed>, instance_id: Uuid, action: &OnEntryAction) {
        match action {
            OnEntryAction::Log { message } => {
                let state = self.current_state(deployed, instance_id).await;
                tracing::info!(%instance_id, machine_id = %deployed.descriptor.machine_id, ?state, %message, "fsm: on-entry log");
            }
            OnEntryAction::StartWindowTimer => {
                let this = self.clone();
                let machine_id = deployed.descriptor.machine_id.clone();
                let callback: ExpiryCallback = Arc::new(move |id| {
                    let this = this.clone();
                    let machine_id = machine_id.clone();
                    Box::pin(async move { this.handle_window_expiry(&machine_id, id).await })
                });
                let info = self.windows.start_window(instance_id, &deployed.descriptor.machine_id, deployed.descriptor.window_ms, callback).await;
                self.mutate_instance(deployed, instance_id, move |inst| {
                    inst.window_started_at = Some(info.started_at);
                    inst.window_expires_at = Some(info.expires_at);
                })
                .await;
            }
            OnEntryAction::CancelWindowTimer => {
                self.windows.cancel_window(instance_id).await;
            }
            OnEntryAction::ResetFsm => {
                self.reset_instance(deployed, instance_id).await;
            }
            OnEntryAction::IncreaseSamplingRate(change) => {
                let change = change.clone();
                tracing::debug!(sensor_id = %change.sensor_id, rate_hz = change.rate_hz, "fsm: sampling rate increased");
                self.mutate_instance(deployed, instance_id, move |inst| inst.active_sampling_rate_changes.push(change)).await;
            }
            OnEntryAction::ResetSamplingRate { sensor_id } => {
                let sensor_id = sensor_id.clone();
                self.mutate_instance(deployed, instance_id, move |inst| inst.active_sampling_rate_changes.retain(|c| c.sensor_id != sensor_id)).await;
            }
            OnEntryAction::ControlActuator(command) => {
                let cancellable_until = command.cancellable_window_ms.map(|ms| Utc::now() + chrono::Duration::milliseconds(ms as i64));
                let taken = LocalActionTaken {
                    actuator_id: command.actuator_id.clone(),
                    command: command.command.clone(),
                    value: command.value.clone(),
                    timestamp: Utc::now(),
                    success: true,
                    cancellable_until,
                };
                self.mutate_instance(deployed, instance_id, move |inst| inst.local_actions_taken.push(taken)).await;
            }
            OnEntryAction::PropagatePartial => {
                self.propagate(deployed, instance_id, false).await;
            }
            OnEntryAction::PropagateEnriched => {
                self.propagate(deployed, instance_id, true).await;
                self.reset_instance(deployed, instance_id).await;
            }
            OnEntryAction::LlmCall(spec) => {
                self.run_llm_call(deployed, instance_id, spec).await;
            }
            OnEntryAction::MlScoreCall(spec) => {
                self.run_step_call(deployed, instance_id, spec, "score").await;
            }
            OnEntryAction::CrmQuery(spec) => {
                self.run_step_call(deployed, instance_id, spec, "record.fetch").await;
            }
            OnEntryAction::ParallelFetch(action) => {
                self.run_parallel_fetch(deployed, instance_id, action).await;
            }
            OnEntryAction::HumanApprovalGate(gate) => {
                self.run_approval_gate_on_entry(deployed, instance_id, gate).await;
            }
        }
    }

    async fn current_state(&self, deployed: &Arc<Deployed>, instance_id: Uuid) -> Option<String> {
        deployed.instances.read().await.get(&instance_id).map(|i| i.current_state.clone())
    }

    async fn mutate_instance<F>(&self, deployed: &Arc<Deployed>, instance_id: Uuid, f: F)
    where
        F: FnOnce(&mut FsmRuntimeState),
    {
        let mut instances = deployed.instances.write().await;
        if let Some(instance) = instances.get_mut(&instance_id) {
            f(instance);
        }
    }

    async fn reset_instance(&self, deployed: &Arc<Deployed>, instance_id: Uuid) {
        deployed.instances.write().await.remove(&instance_id);
        self.windows.cancel_window(instance_id).await;
        self.approvals.cancel_all_for_instance(instance_id).await;
        self.store.remove(instance_id, &deployed.descriptor.machine_id).await;
    }

    async fn scope_for(&self, deployed: &Arc<Deployed>, instance_id: Uuid) -> Value {
        let instances = deployed.instances.read().await;
        match instances.get(&instance_id) {
            Some(instance) => serde_json::json!({ "matched_values": instance.matched_values, "step_outputs": instance.step_outputs }),
            None => Value::Null,
        }
    }

    async fn propagate(&self, deployed: &Arc<Deployed>, instance_id: Uuid, full_match: bool) {
        let Some(instance) = deployed.instances.read().await.get(&instance_id).cloned() else { return };
        let descriptor = &deployed.descriptor;

        let satisfaction_level = if full_match {
            1.0
        } else {
            let total = total_condition_count(descriptor);
            (instance.matched_values.len() as f64 / total as f64).min(1.0)
        };

        let config = &descriptor.propagation_config;
        let matched_values = if config.include_matched_values { instance.matched_values.clone() } else { BTreeMap::new() };
        let local_actions_taken = if config.include_local_actions_taken { instance.local_actions_taken.clone() } else { Vec::new() };
        let precursor_signals = trends::compute_trends(&config.compute_trends, &instance.matched_values);

        let timestamp = Utc::now();
        let remaining_ms = self.windows.remaining_ms(instance_id).await.unwrap_or(0);
        let window_started_at = instance.window_started_at.unwrap_or(instance.created_at);
        let time_window = TimeWindow { started_at: window_started_at, completed_at: timestamp, window_ms: descriptor.window_ms, remaining_ms };

        let signature = config.signature_algorithm.map(|algorithm| {
            signature::sign(
                algorithm,
                self.hmac_key.as_deref(),
                &descriptor.machine_id,
                descriptor.target_node_id.as_deref(),
                timestamp,
                satisfaction_level,
                &instance.matched_values,
            )
        });

        let event = PropagatedEvent {
            event_id: Uuid::new_v4(),
            machine_id: descriptor.machine_id.clone(),
            source_node_id: descriptor.target_node_id.clone(),
            workflow_id: deployed.workflow_id.clone(),
            timestamp,
            satisfaction_level,
            matched_values,
            time_window,
            local_actions_taken,
            precursor_signals,
            signature,
        };

        if let Err(error) = self.event_sink.publish(event).await {
            tracing::warn!(%error, machine_id = %descriptor.machine_id, "fsm: propagate failed");
        }
    }

    async fn run_llm_call(&self, deployed: &Arc<Deployed>, instance_id: Uuid, spec: &LlmCallSpec) {
        let scope = self.scope_for(deployed, instance_id).await;
        let resolved = resolve_dynamic_slots(&spec.llm_context.dynamic_slots, &scope);
        let result = llm::call(spec, &resolved, &deployed.workflow_id).await;
        if let Some(error) = &result.error {
            tracing::warn!(instruction_id = %spec.instruction_id, %error, "fsm: llm_call on-entry failed");
        }
        let instruction_id = spec.instruction_id.clone();
        let output = result.parsed.unwrap_or(Value::Null);
        self.mutate_instance(deployed, instance_id, move |inst| {
            inst.step_outputs.insert(instruction_id, output);
        })
        .await;
    }

    async fn run_step_call(&self, deployed: &Arc<Deployed>, instance_id: Uuid, spec: &StepCallSpec, action: &str) {
        let scope = self.scope_for(deployed, instance_id).await;
        let body = Value::Object(resolve_slots(&spec.slots, &scope));
        let output = match self.connectors.dispatch_with_body(&spec.instruction_id, "system", action, body, &BTreeMap::new()).await {
            Ok(result) => result.raw_response,
            Err(ConnectorError::UnknownConnector(_)) => {
                tracing::debug!(instruction_id = %spec.instruction_id, "fsm: step call stubbed, no connector registered");
                serde_json::json!({ "stub": true })
            }
            Err(error) => {
                tracing::warn!(instruction_id = %spec.instruction_id, %error, "fsm: step call failed");
                Value::Null
            }
        };
        let instruction_id = spec.instruction_id.clone();
        self.mutate_instance(deployed, instance_id, move |inst| {
            inst.step_outputs.insert(instruction_id, output);
        })
        .await;
    }

    async fn run_parallel_fetch(&self, deployed: &Arc<Deployed>, instance_id: Uuid, action: &ParallelFetchAction) {
        let scope = self.scope_for(deployed, instance_id).await;
        let mut futures: Vec<Pin<Box<dyn Future<Output = (String, Value)> + Send + '_>>> = Vec::new();

        for sub in &action.sub_actions {
            match sub {
                OnEntryAction::LlmCall(spec) => {
                    let scope = &scope;
                    futures.push(Box::pin(async move {
                        let resolved = resolve_dynamic_slots(&spec.llm_context.dynamic_slots, scope);
                        let result = llm::call(spec, &resolved, &deployed.workflow_id).await;
                        (spec.instruction_id.clone(), result.parsed.unwrap_or(Value::Null))
                    }));
                }
                OnEntryAction::MlScoreCall(spec) => {
                    let scope = &scope;
                    futures.push(Box::pin(async move {
                        let body = Value::Object(resolve_slots(&spec.slots, scope));
                        let output = self
                            .connectors
                            .dispatch_with_body(&spec.instruction_id, "system", "score", body, &BTreeMap::new())
                            .await
                            .map(|r| r.raw_response)
                            .unwrap_or_else(|_| serde_json::json!({ "stub": true }));
                        (spec.instruction_id.clone(), output)
                    }));
                }
                OnEntryAction::CrmQuery(spec) => {
                    let scope = &scope;
                    futures.push(Box::pin(async move {
                        let body = Value::Object(resolve_slots(&spec.slots, scope));
                        let output = self
                            .connectors
                            .dispatch_with_body(&spec.instruction_id, "system", "record.fetch", body, &BTreeMap::new())
                            .await
                            .map(|r| r.raw_response)
                            .unwrap_or_else(|_| serde_json::json!({ "stub": true }));
                        (spec.instruction_id.clone(), output)
                    }));
                }
                other => {
                    tracing::debug!(?other, "fsm: parallel_fetch sub-action is not a fetch kind, skipped");
                }
            }
        }

        let results = futures::future::join_all(futures).await;
        self.mutate_instance(deployed, instance_id, move |inst| {
            for (instruction_id, output) in results {
                inst.step_outputs.insert(instruction_id, output);
            }
        })
        .await;
    }

    async fn run_approval_gate_on_entry(self: &Arc<Self>, deployed: &Arc<Deployed>, instance_id: Uuid, gate: &ApprovalGateOnEntry) {
        let scope = self.scope_for(deployed, instance_id).await;
        let mut snapshot = Map::new();
        for path in &gate.context_source_paths {
            if let Some(v) = dot_path(&scope, path) {
                snapshot.insert(path.clone(), v.clone());
            }
        }

        self.approvals
            .register_gate(&gate.gate_id, instance_id, &deployed.descriptor.machine_id, &deployed.workflow_id, Value::Object(snapshot), gate.timeout_ms, gate.fallback)
            .await;

        let gate_id = gate.gate_id.clone();
        let registered_at = Utc::now();
        self.mutate_instance(deployed, instance_id, move |inst| {
            inst.pending_approval_gates.insert(gate_id, PendingApprovalGate { registered_at, has_timeout_handle: true });
        })
        .await;
    }
}

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

fn extract_matched_value(condition: &ConditionDescriptor, event: &TriggerEvent) -> Option<Value> {
    match condition {
        ConditionDescriptor::SensorThreshold(c)
        | ConditionDescriptor::MqttValue(c)
        | ConditionDescriptor::KafkaEvent(c)
        | ConditionDescriptor::FieldBusValue(c)
        | ConditionDescriptor::KpiValue(c) => event.resolve_numeric(c.field.as_deref()).map(|v| serde_json::json!(v)),
        _ => Some(event.payload.clone()),
    }
}

fn total_condition_count(descriptor: &EventStateMachineDescriptor) -> usize {
    let mut names: HashSet<&str> = HashSet::new();
    for transition in &descriptor.transitions {
        collect_metric_names(&transition.condition, &mut names);
    }
    names.len().max(1)
}

fn collect_metric_names<'a>(condition: &'a ConditionDescriptor, names: &mut HashSet<&'a str>) {
    names.insert(condition.metric_name());
    if let ConditionDescriptor::CompositeAllOf(c) | ConditionDescriptor::CompositeAnyOf(c) = condition {
        for child in &c.composite_conditions {
            collect_metric_names(child, names);
        }
    }
}

/// Evaluate whether `condition` matches `event`, given the instance's current
/// `step_outputs` (spec.md §4.10 "Condition evaluation"). Boxed for
/// recursion through composites, mirroring the teacher's boxed-recursion
/// `try_advance` pattern.
fn condition_matches<'a>(
    condition: &'a ConditionDescriptor,
    event: &'a TriggerEvent,
    step_outputs: &'a BTreeMap<String, Value>,
) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
    Box::pin(async move {
        match condition {
            ConditionDescriptor::SensorThreshold(c) | ConditionDescriptor::MqttValue(c) | ConditionDescriptor::FieldBusValue(c) | ConditionDescriptor::KpiValue(c) => {
                let value = event.resolve_numeric(c.field.as_deref());
                c.operator.matches(value, c.value, c.min, c.max)
            }
            ConditionDescriptor::KafkaEvent(c) => {
                if event.driver_id != "kafka" {
                    return false;
                }
                if let Some(topic) = &c.topic {
                    if event.payload.get("topic").and_then(Value::as_str) != Some(topic.as_str()) {
                        return false;
                    }
                }
                let value = event.resolve_numeric(c.field.as_deref());
                c.operator.matches(value, c.value, c.min, c.max)
            }
            ConditionDescriptor::RemoteSignal { signal_id, .. } => {
                event.driver_id == "remote_signal" && event.payload.get("signal_id").and_then(Value::as_str) == Some(signal_id.as_str())
            }
            ConditionDescriptor::HumanApproval(c) => {
                if event.driver_id != "human_approval" {
                    return false;
                }
                let gate_matches = event.payload.get("gate_id").and_then(Value::as_str) == Some(c.approval_gate_id.as_str());
                let decision_matches = event
                    .payload
                    .get("decision")
                    .and_then(|d| serde_json::from_value::<crate::types::ApprovalDecision>(d.clone()).ok())
                    == Some(c.expected_decision);
                gate_matches && decision_matches
            }
            ConditionDescriptor::LlmOutput(c) | ConditionDescriptor::MlScore(c) | ConditionDescriptor::CrmResult(c) | ConditionDescriptor::ApiResponse(c) => {
                let Some(output) = step_outputs.get(&c.instruction_id) else { return false };
                let scope = serde_json::json!({ "output": output });
                sandbox::evaluate_bool(&c.semantic_expression, &scope, None).await
            }
            ConditionDescriptor::CompositeAllOf(c) => {
                for child in &c.composite_conditions {
                    if !condition_matches(child, event, step_outputs).await {
                        return false;
                    }
                }
                true
            }
            ConditionDescriptor::CompositeAnyOf(c) => {
                for child in &c.composite_conditions {
                    if condition_matches(child, event, step_outputs).await {
                        return true;
                    }
                }
                false
            }
            ConditionDescriptor::WindowTimerElapsed { .. } => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{MemoryCredentialProvider, MemoryIntegrationRegistry};
    use crate::store_memory::MemoryFsmStateStore;
    use crate::types::{ComparisonOp, NumericCondition, PropagationConfig};
    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    struct CollectingSink {
        events: Arc<AsyncMutex<Vec<PropagatedEvent>>>,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn publish(&self, event: PropagatedEvent) -> anyhow::Result<()> {
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    fn numeric(metric: &str, field: &str, op: ComparisonOp, value: f64) -> ConditionDescriptor {
        ConditionDescriptor::SensorThreshold(NumericCondition {
            metric_name: metric.to_string(),
            topic: None,
            field: Some(field.to_string()),
            operator: op,
            value: Some(value),
            min: None,
            max: None,
        })
    }

    fn descriptor(window_ms: u64) -> EventStateMachineDescriptor {
        EventStateMachineDescriptor {
            machine_id: "m1".to_string(),
            states: vec!["INIT".to_string(), "ARMED".to_string(), "FULL".to_string(), "EXPIRED".to_string()],
            initial_state: "INIT".to_string(),
            full_match_state: "FULL".to_string(),
            expired_state: "EXPIRED".to_string(),
            window_ms,
            transitions: vec![
                Transition {
                    from_states: vec!["INIT".to_string()],
                    to_state: "ARMED".to_string(),
                    condition: numeric("t", "temp", ComparisonOp::Gt, 80.0),
                    guard: Guard::Always,
                    on_entry: vec![OnEntryAction::StartWindowTimer],
                    priority: 99,
                },
                Transition {
                    from_states: vec!["ARMED".to_string()],
                    to_state: "FULL".to_string(),
                    condition: numeric("v", "vib", ComparisonOp::Gt, 5.0),
                    guard: Guard::WithinWindow,
                    on_entry: vec![OnEntryAction::PropagateEnriched],
                    priority: 99,
                },
                Transition {
                    from_states: vec!["ARMED".to_string()],
                    to_state: "EXPIRED".to_string(),
                    condition: ConditionDescriptor::WindowTimerElapsed { metric_name: "timer".to_string() },
                    guard: Guard::WindowElapsed,
                    on_entry: vec![],
                    priority: 99,
                },
            ],
            local_actions_on_full_match: vec![],
            propagation_config: PropagationConfig { include_matched_values: true, include_local_actions_taken: false, compute_trends: vec![], signature_algorithm: None },
            target_node_id: None,
            subscribed_driver_ids: vec![],
        }
    }

    fn event(payload: Value) -> TriggerEvent {
        TriggerEvent { event_id: Uuid::new_v4(), occurred_at: Utc::now(), driver_id: "sensor".to_string(), workflow_id: "wf1".to_string(), workflow_version: 1, payload, source: None }
    }

    fn runtime(sink: Arc<AsyncMutex<Vec<PropagatedEvent>>>) -> Arc<EventStateMachineRuntime> {
        let connectors =
            Arc::new(ConnectorDispatcher::new(Arc::new(MemoryIntegrationRegistry::new()), Arc::new(MemoryCredentialProvider::new())));
        Arc::new(EventStateMachineRuntime::new(
            Arc::new(MemoryFsmStateStore::new()),
            Arc::new(WindowManager::new()),
            Arc::new(ApprovalCoordinator::new()),
            Arc::new(CollectingSink { events: sink }),
            Arc::new(crate::ingress::NullEmitter),
            connectors,
            None,
        ))
    }

    #[tokio::test]
    async fn s1_full_match_propagates_enriched_event() {
        let events = Arc::new(AsyncMutex::new(Vec::new()));
        let rt = runtime(events.clone());
        rt.deploy_fsm("wf1", descriptor(10_000)).await;

        rt.handle_event(&event(serde_json::json!({"temp": 85}))).await;
        assert_eq!(rt.list_instances("m1").await.len(), 1);
        assert_eq!(rt.list_instances("m1").await[0].current_state, "ARMED");

        rt.handle_event(&event(serde_json::json!({"vib": 6}))).await;

        let published = events.lock().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].satisfaction_level, 1.0);
        assert_eq!(published[0].matched_values["t"].value, serde_json::json!(85.0));
        assert_eq!(published[0].matched_values["v"].value, serde_json::json!(6.0));
        drop(published);

        // propagate_enriched resets the instance.
        assert!(rt.list_instances("m1").await.is_empty());
    }

    #[tokio::test]
    async fn window_expiry_transitions_to_expired_and_resets() {
        let events = Arc::new(AsyncMutex::new(Vec::new()));
        let rt = runtime(events);
        rt.deploy_fsm("wf1", descriptor(30)).await;

        rt.handle_event(&event(serde_json::json!({"temp": 85}))).await;
        assert_eq!(rt.list_instances("m1").await.len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(rt.list_instances("m1").await.is_empty());
    }

    #[tokio::test]
    async fn unmatched_event_does_not_start_an_instance() {
        let events = Arc::new(AsyncMutex::new(Vec::new()));
        let rt = runtime(events);
        rt.deploy_fsm("wf1", descriptor(10_000)).await;

        rt.handle_event(&event(serde_json::json!({"temp": 10}))).await;
        assert!(rt.list_instances("m1").await.is_empty());
    }

    #[tokio::test]
    async fn undeploy_workflow_removes_machine_and_cancels_windows() {
        let events = Arc::new(AsyncMutex::new(Vec::new()));
        let rt = runtime(events);
        rt.deploy_fsm("wf1", descriptor(10_000)).await;
        rt.handle_event(&event(serde_json::json!({"temp": 85}))).await;
        assert_eq!(rt.list_instances("m1").await.len(), 1);

        rt.undeploy_workflow("wf1").await;
        assert!(rt.list_instances("m1").await.is_empty());
    }
}
