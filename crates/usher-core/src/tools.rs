use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::SessionId;
use crate::protocol::{EffectDelta, FlagMap, IdentifierMap, ToolDescriptor};

/// Context available to tools during execution. Identifier-consuming tools
/// must read recorded identifiers from here, never trust model arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: SessionId,
    pub turn_index: u64,
    pub flags: FlagMap,
    pub identifiers: IdentifierMap,
    /// Stable across retries of the same logical invocation. Side-effecting
    /// tools treat a repeated token as the same request.
    pub dedup_token: String,
    pub abort: CancellationToken,
}

impl ToolContext {
    pub fn new(
        session_id: SessionId,
        turn_index: u64,
        flags: FlagMap,
        identifiers: IdentifierMap,
        abort: CancellationToken,
    ) -> Self {
        let dedup_token = format!("{session_id}:{turn_index}");
        Self {
            session_id,
            turn_index,
            flags,
            identifiers,
            dedup_token,
            abort,
        }
    }
}

/// Result of a successful tool invocation: content for the model plus the
/// declared effects as a delta. The tool never mutates session state itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: serde_json::Value,
    pub delta: EffectDelta,
}

impl ToolOutput {
    pub fn content_only(content: serde_json::Value) -> Self {
        Self {
            content,
            delta: EffectDelta::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("identifier conflict: {0}")]
    IdentifierConflict(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("external service error: {0}")]
    ExternalService(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ToolError {
    /// Transient backend failures only. Protocol and argument errors are
    /// corrected through the model feedback loop instead.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalService(_) | Self::Timeout(_))
    }
}

/// Trait implemented by each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;
}
