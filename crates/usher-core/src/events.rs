use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId};

/// Events streamed to the Connection Gateway while a turn executes.
/// Tool and summary payloads never carry summary content - the silent
/// summarization protocol keeps it out of everything user-facing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "processing")]
    Processing { session_id: SessionId },

    #[serde(rename = "partial_text")]
    PartialText { session_id: SessionId, delta: String },

    #[serde(rename = "tool_start")]
    ToolStart {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
    },

    #[serde(rename = "tool_end")]
    ToolEnd {
        session_id: SessionId,
        tool_call_id: ToolCallId,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
    },

    #[serde(rename = "consent_required")]
    ConsentRequired {
        session_id: SessionId,
        tool_name: String,
        prompt: String,
    },

    /// Session could not be restored; state was reinitialized.
    #[serde(rename = "context_reset")]
    ContextReset { session_id: SessionId, message: String },

    #[serde(rename = "final_text")]
    FinalText { session_id: SessionId, text: String },

    #[serde(rename = "error")]
    Error { session_id: SessionId, message: String },

    #[serde(rename = "completed")]
    Completed { session_id: SessionId, turn_index: u64 },
}

impl TurnEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::Processing { session_id }
            | Self::PartialText { session_id, .. }
            | Self::ToolStart { session_id, .. }
            | Self::ToolEnd { session_id, .. }
            | Self::ConsentRequired { session_id, .. }
            | Self::ContextReset { session_id, .. }
            | Self::FinalText { session_id, .. }
            | Self::Error { session_id, .. }
            | Self::Completed { session_id, .. } => session_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Processing { .. } => "processing",
            Self::PartialText { .. } => "partial_text",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::ConsentRequired { .. } => "consent_required",
            Self::ContextReset { .. } => "context_reset",
            Self::FinalText { .. } => "final_text",
            Self::Error { .. } => "error",
            Self::Completed { .. } => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }
}
