use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ModelError;
use crate::protocol::{FlagMap, IdentifierMap, ToolCallRequest, ToolDescriptor};
use crate::turns::TurnRecord;

/// Everything the model sees when proposing the next action: the transcript,
/// the current protocol state, the available tools, and any corrective notes
/// from earlier cycles of the same turn.
#[derive(Clone, Debug, Default)]
pub struct PromptContext {
    pub turns: Vec<TurnRecord>,
    pub flags: FlagMap,
    pub identifiers: IdentifierMap,
    pub tools: Vec<ToolDescriptor>,
    /// Internal repair instructions. Never user-visible, never persisted.
    pub notes: Vec<String>,
}

impl PromptContext {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// What the model proposes for the current turn. No correctness guarantee is
/// assumed - every tool call goes through the Protocol Guard regardless.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ProposedAction {
    Reply { text: String },
    ToolCall(ToolCallRequest),
    ConsentRequest { tool: String, prompt: String },
}

/// Black-box text-generation capability.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Propose the next action for a turn.
    async fn propose(&self, context: &PromptContext) -> Result<ProposedAction, ModelError>;

    /// Free-form completion, used by the summarizer.
    async fn generate(&self, prompt: &str) -> Result<String, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_context() {
        let ctx = PromptContext::empty();
        assert!(ctx.turns.is_empty());
        assert!(ctx.tools.is_empty());
        assert!(ctx.notes.is_empty());
    }

    #[test]
    fn proposed_action_serde() {
        let action = ProposedAction::Reply { text: "hello".into() };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "reply");
        assert_eq!(json["text"], "hello");

        let action = ProposedAction::ToolCall(ToolCallRequest::new(
            "check_availability",
            serde_json::json!({"specialist_id": "PS-301"}),
        ));
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "tool_call");
        assert_eq!(json["name"], "check_availability");

        let action = ProposedAction::ConsentRequest {
            tool: "onboard_customer".into(),
            prompt: "May I save your details?".into(),
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "consent_request");
    }
}
