//! Propagated Event Dispatcher (C9, spec.md §4.9).
//!
//! Routes full/partial FSM matches to registered handler descriptors and
//! dispatches remote commands. Implements `ingress::EventSink` so C10 can
//! depend on the trait alone, breaking the C9/C10 cyclic reference
//! (spec.md §9).

use crate::connector::ConnectorDispatcher;
use crate::ingress::{EventSink, RemoteCommandEmitter};
use crate::pipeline::PipelineExecutor;
use crate::sandbox::{self, render_template};
use crate::types::{PropagatedEvent, RemoteCommand};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

const HISTORY_CAP: usize = 500;

static RAW_HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "params", rename_all = "snake_case")]
pub enum HandlerAction {
    Alert { message_template: String, severity: String },
    CreateTicket { connector_id: String, principal_id: String, slots: BTreeMap<String, String> },
    DispatchRemoteCommand { target_node_id: String, command: String, params_template: BTreeMap<String, String> },
    EvaluateAndForward {
        signal_name: String,
        condition: String,
        target_node_id: String,
        command_on_true: String,
        command_on_false: String,
    },
    CallHttp { url_template: String, method: String, body_template: Option<String> },
    PersistEvent,
    AuditLog { message_template: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandlerDescriptor {
    pub handler_id: String,
    pub workflow_id: String,
    pub triggered_by_machine_id: String,
    #[serde(default)]
    pub min_satisfaction_level: f64,
    #[serde(default)]
    pub parallel_actions: Vec<HandlerAction>,
    #[serde(default)]
    pub pipeline: Vec<crate::types::PipelineStep>,
}

pub struct PropagatedEventDispatcher {
    handlers: RwLock<HashMap<String, Vec<HandlerDescriptor>>>,
    history: RwLock<VecDeque<PropagatedEvent>>,
    pipeline_executor: Arc<PipelineExecutor>,
    connectors: Arc<ConnectorDispatcher>,
    remote_emitter: Arc<dyn RemoteCommandEmitter>,
}

impl PropagatedEventDispatcher {
    pub fn new(
        pipeline_executor: Arc<PipelineExecutor>,
        connectors: Arc<ConnectorDispatcher>,
        remote_emitter: Arc<dyn RemoteCommandEmitter>,
    ) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAP)),
            pipeline_executor,
            connectors,
            remote_emitter,
        }
    }

    pub async fn register_handler(&self, handler: HandlerDescriptor) {
        let mut handlers = self.handlers.write().await;
        handlers.entry(handler.triggered_by_machine_id.clone()).or_default().push(handler);
    }

    pub async fn unregister_workflow(&self, workflow_id: &str) {
        let mut handlers = self.handlers.write().await;
        for bucket in handlers.values_mut() {
            bucket.retain(|h| h.workflow_id != workflow_id);
        }
        handlers.retain(|_, bucket| !bucket.is_empty());
    }

    pub async fn history(&self) -> Vec<PropagatedEvent> {
        self.history.read().await.iter().cloned().collect()
    }

    async fn record_history(&self, event: &PropagatedEvent) {
        let mut history = self.history.write().await;
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(event.clone());
    }

    async fn eligible_handlers(&self, event: &PropagatedEvent) -> Vec<HandlerDescriptor> {
        let handlers = self.handlers.read().await;
        handlers
            .get(&event.machine_id)
            .map(|bucket| bucket.iter().filter(|h| event.satisfaction_level >= h.min_satisfaction_level).cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for PropagatedEventDispatcher {
    /// Appends to history synchronously (so history order matches publish
    /// order), then hands handler execution to a background task so the
    /// FSM runtime's dispatch call never blocks on handler/pipeline work
    /// (spec.md §5: "handlers run concurrently across handlers and
    /// concurrently across events").
    async fn publish(&self, event: PropagatedEvent) -> anyhow::Result<()> {
        self.record_history(&event).await;
        let eligible = self.eligible_handlers(&event).await;

        let pipeline_executor = self.pipeline_executor.clone();
        let connectors = self.connectors.clone();
        let remote_emitter = self.remote_emitter.clone();

        tokio::spawn(async move {
            let futures = eligible
                .into_iter()
                .map(|handler| run_handler(pipeline_executor.clone(), connectors.clone(), remote_emitter.clone(), handler, event.clone()));
            futures::future::join_all(futures).await;
        });

        Ok(())
    }
}

async fn run_handler(
    pipeline_executor: Arc<PipelineExecutor>,
    connectors: Arc<ConnectorDispatcher>,
    remote_emitter: Arc<dyn RemoteCommandEmitter>,
    handler: HandlerDescriptor,
    event: PropagatedEvent,
) {
    let scope = serde_json::json!({ "event": event });
    let action_futures = handler.parallel_actions.iter().map(|action| run_action(&connectors, &remote_emitter, action, &event, &scope));
    let results = futures::future::join_all(action_futures).await;
    for (action, result) in handler.parallel_actions.iter().zip(results) {
        if let Err(error) = result {
            tracing::warn!(handler_id = %handler.handler_id, ?action, %error, "dispatcher: handler action failed");
        }
    }

    if !handler.pipeline.is_empty() {
        let ctx = pipeline_executor.execute(&handler.pipeline, event, Some(&handler.handler_id)).await;
        if ctx.result == crate::types::PipelineResult::Failed {
            tracing::warn!(handler_id = %handler.handler_id, "dispatcher: handler pipeline finished with failures");
        }
    }
}

async fn run_action(
    connectors: &Arc<ConnectorDispatcher>,
    remote_emitter: &Arc<dyn RemoteCommandEmitter>,
    action: &HandlerAction,
    event: &PropagatedEvent,
    scope: &serde_json::Value,
) -> anyhow::Result<()> {
    match action {
        HandlerAction::Alert { message_template, severity } => {
            let message = render_template(message_template, scope, None).await;
            tracing::warn!(%message, severity, "dispatcher: alert");
            Ok(())
        }
        HandlerAction::CreateTicket { connector_id, principal_id, slots } => {
            connectors.dispatch(connector_id, principal_id, "ticket.create", slots, &BTreeMap::new(), scope).await?;
            Ok(())
        }
        HandlerAction::DispatchRemoteCommand { target_node_id, command, params_template } => {
            let mut params = serde_json::Map::new();
            for (k, template) in params_template {
                params.insert(k.clone(), serde_json::Value::String(render_template(template, scope, None).await));
            }
            let remote_command = RemoteCommand {
                command_id: Uuid::new_v4(),
                command: command.clone(),
                params: serde_json::Value::Object(params),
                source_event_id: Some(event.event_id),
                source_machine_id: Some(event.machine_id.clone()),
                deploy_fsm: None,
            };
            remote_emitter.emit(target_node_id, remote_command).await
        }
        HandlerAction::EvaluateAndForward { signal_name, condition, target_node_id, command_on_true, command_on_false } => {
            let signal = event.precursor_signals.iter().find(|s| &s.metric_name == signal_name);
            let signal_scope = serde_json::json!({ "event": event, "signal": signal });
            let matched = sandbox::evaluate_bool(condition, &signal_scope, None).await;
            let command = if matched { command_on_true } else { command_on_false };
            let remote_command = RemoteCommand {
                command_id: Uuid::new_v4(),
                command: command.clone(),
                params: serde_json::json!({ "signal_name": signal_name, "matched": matched }),
                source_event_id: Some(event.event_id),
                source_machine_id: Some(event.machine_id.clone()),
                deploy_fsm: None,
            };
            remote_emitter.emit(target_node_id, remote_command).await
        }
        HandlerAction::CallHttp { url_template, method, body_template } => {
            let url = render_template(url_template, scope, None).await;
            let http_method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes()).unwrap_or(reqwest::Method::GET);
            let mut request = RAW_HTTP_CLIENT.request(http_method, &url);
            if let Some(template) = body_template {
                request = request.body(render_template(template, scope, None).await);
            }
            let response = request.send().await.map_err(|e| anyhow::anyhow!("call_http transport error: {e}"))?;
            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("call_http upstream {}: {}", status.as_u16(), text);
            }
            tracing::debug!(url, status = status.as_u16(), "dispatcher: call_http action");
            Ok(())
        }
        HandlerAction::PersistEvent => {
            tracing::debug!(event_id = %event.event_id, "dispatcher: persist_event (no-op sink, delegated to embedder)");
            Ok(())
        }
        HandlerAction::AuditLog { message_template } => {
            let message = render_template(message_template, scope, None).await;
            tracing::info!(%message, "dispatcher: audit_log");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalCoordinator;
    use crate::connector::{MemoryCredentialProvider, MemoryIntegrationRegistry};
    use crate::ingress::NullEmitter;
    use crate::types::TimeWindow;
    use chrono::Utc;

    fn event(machine_id: &str, satisfaction: f64) -> PropagatedEvent {
        PropagatedEvent {
            event_id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            source_node_id: None,
            workflow_id: "wf1".to_string(),
            timestamp: Utc::now(),
            satisfaction_level: satisfaction,
            matched_values: Default::default(),
            time_window: TimeWindow { started_at: Utc::now(), completed_at: Utc::now(), window_ms: 1000, remaining_ms: 0 },
            local_actions_taken: vec![],
            precursor_signals: vec![],
            signature: None,
        }
    }

    fn dispatcher() -> Arc<PropagatedEventDispatcher> {
        let connectors =
            Arc::new(ConnectorDispatcher::new(Arc::new(MemoryIntegrationRegistry::new()), Arc::new(MemoryCredentialProvider::new())));
        let pipeline_executor = Arc::new(PipelineExecutor::new(connectors.clone(), Arc::new(ApprovalCoordinator::new())));
        Arc::new(PropagatedEventDispatcher::new(pipeline_executor, connectors, Arc::new(NullEmitter)))
    }

    #[tokio::test]
    async fn register_and_unregister_handler_lifecycle() {
        let d = dispatcher();
        d.register_handler(HandlerDescriptor {
            handler_id: "h1".to_string(),
            workflow_id: "wf1".to_string(),
            triggered_by_machine_id: "m1".to_string(),
            min_satisfaction_level: 0.0,
            parallel_actions: vec![],
            pipeline: vec![],
        })
        .await;

        d.publish(event("m1", 1.0)).await.unwrap();
        assert_eq!(d.history().await.len(), 1);

        d.unregister_workflow("wf1").await;
        let handlers = d.handlers.read().await;
        assert!(handlers.get("m1").is_none());
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let d = dispatcher();
        for _ in 0..(HISTORY_CAP + 10) {
            d.publish(event("m1", 1.0)).await.unwrap();
        }
        assert_eq!(d.history().await.len(), HISTORY_CAP);
    }

    #[tokio::test]
    async fn low_satisfaction_event_is_recorded_but_not_eligible() {
        let d = dispatcher();
        d.register_handler(HandlerDescriptor {
            handler_id: "h1".to_string(),
            workflow_id: "wf1".to_string(),
            triggered_by_machine_id: "m1".to_string(),
            min_satisfaction_level: 0.9,
            parallel_actions: vec![],
            pipeline: vec![],
        })
        .await;

        let eligible = d.eligible_handlers(&event("m1", 0.5)).await;
        assert!(eligible.is_empty());
        let eligible = d.eligible_handlers(&event("m1", 0.95)).await;
        assert_eq!(eligible.len(), 1);
    }
}
