//! Shared application state handed to every handler via `Extension`.

use std::sync::Arc;

use evflow_core::approval::ApprovalCoordinator;
use evflow_core::fsm::EventStateMachineRuntime;

#[derive(Clone)]
pub struct AppState {
    pub approvals: Arc<ApprovalCoordinator>,
    pub runtime: Arc<EventStateMachineRuntime>,
}
