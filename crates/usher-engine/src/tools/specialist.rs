use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, instrument};

use usher_core::protocol::{EffectDelta, ToolDescriptor};
use usher_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

use crate::backends::{Specialist, SpecialistRoster};

pub const FIND_SPECIALIST_TOOL: &str = "find_specialist";

#[derive(Deserialize)]
struct FindSpecialistArgs {
    query: String,
}

/// Match the customer's need to one specialist by deterministic relevance
/// scoring over the roster. The selected id becomes an immutable identifier;
/// a later re-match is denied by the guard rather than silently swapped.
pub struct FindSpecialistTool {
    roster: Arc<dyn SpecialistRoster>,
}

impl FindSpecialistTool {
    pub fn new(roster: Arc<dyn SpecialistRoster>) -> Self {
        Self { roster }
    }
}

#[async_trait]
impl Tool for FindSpecialistTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            FIND_SPECIALIST_TOOL,
            "Select the specialist best matching the customer's described need.",
        )
        .with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "The customer's need in their own words"},
            },
            "required": ["query"],
        }))
        .with_effect_identifier("specialist_id")
        .with_effect_flag("specialist_selected")
    }

    #[instrument(skip(self, args, _ctx), fields(session_id = %_ctx.session_id))]
    async fn execute(
        &self,
        args: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: FindSpecialistArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(format!("specialist query: {e}")))?;
        if args.query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".into()));
        }

        let roster = self
            .roster
            .all()
            .map_err(|e| ToolError::ExternalService(e.to_string()))?;
        if roster.is_empty() {
            return Err(ToolError::ExternalService("no specialists available".into()));
        }

        let best = best_match(&args.query, &roster);
        info!(specialist_id = %best.specialist_id, "specialist selected");

        Ok(ToolOutput {
            content: serde_json::json!({
                "success": true,
                "message": format!("Specialist selected: {}, Title: {}", best.name, best.title),
                "specialist_id": best.specialist_id,
                "specialist_name": best.name,
                "specialist_details": best,
            }),
            delta: EffectDelta::new()
                .with_identifier("specialist_id", best.specialist_id.clone())
                .with_flag("specialist_selected", true),
        })
    }
}

/// Count query-token hits across title, products, skills, and industries.
/// Ties resolve to roster order, so selection is stable.
fn best_match<'a>(query: &str, roster: &'a [Specialist]) -> &'a Specialist {
    let tokens: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect();

    let score = |s: &Specialist| -> usize {
        let haystack = format!(
            "{} {} {} {}",
            s.title.to_lowercase(),
            s.products.join(" ").to_lowercase(),
            s.skills.join(" ").to_lowercase(),
            s.industries.join(" ").to_lowercase(),
        );
        tokens.iter().filter(|t| haystack.contains(t.as_str())).count()
    };

    let mut best = &roster[0];
    let mut best_score = score(best);
    for candidate in &roster[1..] {
        let candidate_score = score(candidate);
        if candidate_score > best_score {
            best = candidate;
            best_score = candidate_score;
        }
    }
    best
}
