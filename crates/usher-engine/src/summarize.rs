//! Silent summarization: milestone bookkeeping, the trigger predicate, and the
//! model-backed summarizer tool. Summaries are stored, never surfaced in any
//! user-visible reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use usher_core::protocol::{EffectDelta, ToolDescriptor};
use usher_core::provider::ModelProvider;
use usher_core::tools::{Tool, ToolContext, ToolError, ToolOutput};
use usher_core::turns::TurnRecord;

pub const SUMMARIZE_TOOL: &str = "summarize_conversation";

/// Keyword vocabulary that triggers a mid-conversation summary. The concrete
/// list is configuration, not core logic.
#[derive(Clone, Debug)]
pub struct SummaryTriggers {
    pub keywords: Vec<String>,
}

impl Default for SummaryTriggers {
    fn default() -> Self {
        Self {
            keywords: [
                "budget",
                "timeline",
                "stakeholder",
                "decision maker",
                "sign me up",
                "next steps",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl SummaryTriggers {
    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
    }
}

/// Compute the summarization milestone for a turn, if any. A booking effect
/// outranks a keyword hit; each milestone fires at most once per session.
pub fn milestone_for(
    booked_appointment: Option<&str>,
    user_text: &str,
    user_turn_index: u64,
    triggers: &SummaryTriggers,
) -> Option<String> {
    if let Some(appointment_id) = booked_appointment {
        return Some(format!("booking:{appointment_id}"));
    }
    if triggers.matches(user_text) {
        return Some(format!("keyword-turn:{user_turn_index}"));
    }
    None
}

#[derive(Deserialize)]
struct SummarizeArgs {
    transcript: Vec<TurnRecord>,
    turn_index: u64,
}

/// Model-backed summarizer. Invoked only by the orchestrator at milestones,
/// through the same registry path as every other tool.
pub struct SummarizeTool {
    provider: Arc<dyn ModelProvider>,
}

impl SummarizeTool {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }

    fn build_prompt(transcript: &[TurnRecord]) -> String {
        let mut prompt = String::from(
            "Summarize the following conversation as a single JSON object with keys \
             \"summary\", \"customer_info\" (keys: name, company, domain, email, topic), \
             \"specialist_info\" (keys: name, designation, expertise), \
             \"customer_sentiment\", and \"minutes_of_meeting\" (chronological, as \
             detailed as possible). Return only the JSON object.\nMessages:\n",
        );
        for turn in transcript {
            prompt.push_str(&format!("Role: {}, Content: {}\n", turn.role, turn.content));
        }
        prompt
    }
}

#[async_trait]
impl Tool for SummarizeTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            SUMMARIZE_TOOL,
            "Produce a structured summary of the conversation for the lead record.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "transcript": {"type": "array"},
                "turn_index": {"type": "integer"},
            },
            "required": ["transcript", "turn_index"],
        }))
        .with_effect_flag("last_summary_turn_index")
    }

    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: SummarizeArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(format!("summarize args: {e}")))?;

        if args.transcript.is_empty() {
            return Err(ToolError::InvalidArguments("nothing to summarize".into()));
        }

        let prompt = Self::build_prompt(&args.transcript);
        let raw = self
            .provider
            .generate(&prompt)
            .await
            .map_err(|e| ToolError::ExternalService(format!("summarizer model: {e}")))?;

        let cleaned = strip_code_fences(&raw);
        let payload = match serde_json::from_str::<serde_json::Value>(cleaned) {
            Ok(json) => json,
            Err(e) => {
                // Keep the raw text rather than losing the lead record
                warn!(error = %e, "summary was not valid JSON, storing as plain text");
                serde_json::json!({"summary": cleaned})
            }
        };

        Ok(ToolOutput {
            content: payload,
            delta: EffectDelta::new().with_flag("last_summary_turn_index", args.turn_index),
        })
    }
}

/// Models frequently wrap JSON in markdown fences; strip them.
fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}
