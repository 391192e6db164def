//! evflow-server — standalone REST server for the workflow engine runtime.
//!
//! Reads config from env vars:
//!   EVFLOW_BIND_ADDR     — listen address (default: 0.0.0.0:8080)
//!   EVFLOW_HMAC_KEY      — optional HMAC key for propagated-event signatures

use std::sync::Arc;

use evflow_core::approval::ApprovalCoordinator;
use evflow_core::connector::{ConnectorDispatcher, MemoryCredentialProvider, MemoryIntegrationRegistry};
use evflow_core::dispatcher::PropagatedEventDispatcher;
use evflow_core::fsm::EventStateMachineRuntime;
use evflow_core::ingress::{ChannelTriggerSource, NullEmitter, TriggerSource};
use evflow_core::pipeline::PipelineExecutor;
use evflow_core::store_memory::MemoryFsmStateStore;
use evflow_core::window::WindowManager;
use evflow_server::router::build_router;
use evflow_server::state::AppState;
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,evflow_server=debug,evflow_core=debug".into()),
        )
        .init();

    let bind_addr = std::env::var("EVFLOW_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let hmac_key = std::env::var("EVFLOW_HMAC_KEY").ok().map(|k| k.into_bytes());

    let store = Arc::new(MemoryFsmStateStore::new());
    let windows = Arc::new(WindowManager::new());
    let approvals = Arc::new(ApprovalCoordinator::new());

    let registry = Arc::new(MemoryIntegrationRegistry::new());
    let credentials = Arc::new(MemoryCredentialProvider::new());
    let connectors = Arc::new(ConnectorDispatcher::new(registry, credentials));

    let pipeline_executor = Arc::new(PipelineExecutor::new(connectors.clone(), approvals.clone()));
    let remote_emitter = Arc::new(NullEmitter);
    let dispatcher = Arc::new(PropagatedEventDispatcher::new(pipeline_executor, connectors.clone(), remote_emitter.clone()));

    let runtime = Arc::new(EventStateMachineRuntime::new(store, windows, approvals.clone(), dispatcher, remote_emitter, connectors, hmac_key));

    let trigger_source = Arc::new(ChannelTriggerSource::default());
    let triggers = trigger_source.subscribe();
    let approval_events = approvals.subscribe();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let runtime_handle = runtime.clone();
    tokio::spawn(async move {
        runtime_handle.run(triggers, approval_events, shutdown_rx).await;
    });
    tracing::info!("fsm runtime spawned");

    let state = AppState { approvals, runtime };
    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr).await.unwrap_or_else(|e| panic!("failed to bind to {bind_addr}: {e}"));
    tracing::info!("evflow-server listening on {bind_addr}");

    axum::serve(listener, app).await.expect("server error");

    let _ = shutdown_tx.send(true);
}
