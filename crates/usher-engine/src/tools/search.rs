use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::instrument;

use usher_core::protocol::ToolDescriptor;
use usher_core::retrieval::{RetrievalError, Retriever};
use usher_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

pub const CASE_STUDIES_TOOL: &str = "search_case_studies";
pub const TESTIMONIALS_TOOL: &str = "search_testimonials";

#[derive(Deserialize)]
struct SearchArgs {
    query: String,
    #[serde(default)]
    top_k: Option<usize>,
}

/// Read-only retrieval over a named corpus. Summaries of what comes back are
/// the model's job; the tool never writes session state.
pub struct SearchTool {
    name: &'static str,
    description: &'static str,
    corpus: &'static str,
    default_k: usize,
    retriever: Arc<dyn Retriever>,
}

impl SearchTool {
    pub fn case_studies(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            name: CASE_STUDIES_TOOL,
            description: "Find case studies relevant to the customer's situation. \
                          Present only what is returned.",
            corpus: "case_studies",
            default_k: 3,
            retriever,
        }
    }

    pub fn testimonials(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            name: TESTIMONIALS_TOOL,
            description: "Find customer testimonials relevant to the conversation. \
                          Present only what is returned.",
            corpus: "testimonials",
            default_k: 2,
            retriever,
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(self.name, self.description).with_schema(serde_json::json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "top_k": {"type": "integer", "minimum": 1},
            },
            "required": ["query"],
        }))
    }

    #[instrument(skip(self, args, ctx), fields(session_id = %ctx.session_id, corpus = self.corpus))]
    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let args: SearchArgs = serde_json::from_value(args)
            .map_err(|e| ToolError::InvalidArguments(format!("search args: {e}")))?;
        if args.query.trim().is_empty() {
            return Err(ToolError::InvalidArguments("query must not be empty".into()));
        }

        let k = args.top_k.unwrap_or(self.default_k);
        let hits = self
            .retriever
            .search(&args.query, self.corpus, k)
            .await
            .map_err(|e| match e {
                RetrievalError::UnknownCorpus(c) => {
                    ToolError::ExternalService(format!("corpus not loaded: {c}"))
                }
                RetrievalError::Backend(msg) => ToolError::ExternalService(msg),
            })?;

        Ok(ToolOutput::content_only(serde_json::json!({ "results": hits })))
    }
}
