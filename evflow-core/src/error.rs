//! Typed, caller-facing error enums. Internal orchestration glue keeps using
//! `anyhow::Result` the way the engine facade this crate is grounded on
//! does; these enums exist for the boundaries spec.md §7 calls out as
//! needing structured propagation (validation errors, connector/LLM I/O,
//! the REST surface).

use thiserror::Error;

/// Errors surfaced across the REST approval boundary (spec.md §6/§7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::NotFound(_) => 404,
            EngineError::InvalidInput(_) => 400,
            EngineError::Conflict(_) => 409,
            EngineError::Validation(_) => 422,
            EngineError::Internal(_) => 500,
        }
    }
}

/// Transient/typed errors from the connector dispatcher (C5).
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("unknown connector: {0}")]
    UnknownConnector(String),

    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("output extraction failed: path {0} not found in response")]
    ExtractionFailed(String),
}

/// Transient/typed errors from the LLM caller (C6).
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("unknown provider for model: {0}")]
    UnknownProvider(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("output failed schema validation: {0}")]
    SchemaValidation(String),

    #[error("retries exhausted after {0} attempts")]
    RetriesExhausted(u32),
}
