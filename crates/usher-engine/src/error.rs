use usher_core::errors::ModelError;
use usher_core::tools::ToolError;
use usher_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("session busy: {0}")]
    SessionBusy(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("turn aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}
