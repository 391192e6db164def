//! evflow-server — REST approval surface for the workflow engine runtime.
//!
//! Routes:
//!   GET    /healthz                — liveness check (no auth)
//!   GET    /approvals              — pending gates
//!   GET    /approvals/summary      — `{pending, total}`
//!   GET    /approvals/:gate_id     — full gate record
//!   POST   /approvals/:gate_id     — resolve a pending gate
//!   DELETE /approvals/:gate_id     — cancel a pending gate

pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
