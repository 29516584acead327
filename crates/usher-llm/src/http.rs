use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::instrument;

use usher_core::errors::ModelError;
use usher_core::protocol::{ToolCallRequest, ToolDescriptor};
use usher_core::provider::{ModelProvider, PromptContext, ProposedAction};
use usher_core::retrieval::RetrievalError;
use usher_core::turns::TurnRole;

use crate::retrieval::Embedder;

/// Synthetic function the model calls to ask for user consent instead of
/// executing a gated tool directly.
const CONSENT_FUNCTION: &str = "request_consent";

#[derive(Clone, Debug)]
pub struct HttpModelConfig {
    pub base_url: String,
    pub api_key: SecretString,
    pub model: String,
    /// Business persona and journey instructions. Configuration, not logic:
    /// protocol enforcement never depends on this text.
    pub system_prompt: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub request_timeout: Duration,
}

impl HttpModelConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: "https://api.openai.com/v1".into(),
            api_key: SecretString::from(api_key.into()),
            model: model.into(),
            system_prompt: String::new(),
            temperature: None,
            max_tokens: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Chat-completions provider speaking the OpenAI-compatible wire format.
pub struct HttpModel {
    client: reqwest::Client,
    config: HttpModelConfig,
}

impl HttpModel {
    pub fn new(config: HttpModelConfig) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ModelError::InvalidRequest(format!("client build: {e}")))?;
        Ok(Self { client, config })
    }

    async fn post_chat(&self, body: serde_json::Value) -> Result<serde_json::Value, ModelError> {
        let url = format!("{}/chat/completions", self.config.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(self.config.request_timeout)
                } else {
                    ModelError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ModelError::RateLimited { retry_after });
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| ModelError::MalformedOutput(format!("response body: {e}")))
    }
}

#[async_trait]
impl ModelProvider for HttpModel {
    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, context), fields(model = %self.config.model))]
    async fn propose(&self, context: &PromptContext) -> Result<ProposedAction, ModelError> {
        let mut body = json!({
            "model": self.config.model,
            "messages": build_messages(&self.config.system_prompt, context),
            "tools": build_tool_definitions(&context.tools),
        });
        if let Some(t) = self.config.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = self.config.max_tokens {
            body["max_tokens"] = json!(m);
        }

        let response = self.post_chat(body).await?;
        parse_proposal(&response)
    }

    #[instrument(skip(self, prompt), fields(model = %self.config.model))]
    async fn generate(&self, prompt: &str) -> Result<String, ModelError> {
        let body = json!({
            "model": self.config.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self.post_chat(body).await?;
        response["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ModelError::MalformedOutput("missing content".into()))
    }
}

/// Assemble the chat transcript: system prompt + protocol state, then the
/// turn history, then any corrective notes from this turn's repair loop.
fn build_messages(system_prompt: &str, context: &PromptContext) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(context.turns.len() + context.notes.len() + 1);

    let state = json!({
        "flags": context.flags,
        "identifiers": context.identifiers,
    });
    messages.push(json!({
        "role": "system",
        "content": format!("{system_prompt}\n\nProtocol state (authoritative, read-only):\n{state}"),
    }));

    for turn in &context.turns {
        let (role, content) = match turn.role {
            TurnRole::User => ("user", turn.content.clone()),
            TurnRole::Assistant => ("assistant", turn.content.clone()),
            TurnRole::System => ("system", turn.content.clone()),
            TurnRole::Tool => ("system", format!("Tool result: {}", turn.content)),
        };
        messages.push(json!({"role": role, "content": content}));
    }

    for note in &context.notes {
        messages.push(json!({"role": "system", "content": note}));
    }

    messages
}

fn build_tool_definitions(tools: &[ToolDescriptor]) -> Vec<serde_json::Value> {
    let mut defs: Vec<serde_json::Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters_schema,
                },
            })
        })
        .collect();

    defs.push(json!({
        "type": "function",
        "function": {
            "name": CONSENT_FUNCTION,
            "description": "Ask the user for explicit consent before a consent-gated tool may run.",
            "parameters": {
                "type": "object",
                "properties": {
                    "tool": {"type": "string"},
                    "prompt": {"type": "string"},
                },
                "required": ["tool", "prompt"],
            },
        },
    }));

    defs
}

fn parse_proposal(response: &serde_json::Value) -> Result<ProposedAction, ModelError> {
    let message = &response["choices"][0]["message"];

    if let Some(tool_call) = message["tool_calls"][0]["function"].as_object() {
        let name = tool_call
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| ModelError::MalformedOutput("tool call missing name".into()))?;
        let raw_args = tool_call
            .get("arguments")
            .and_then(|a| a.as_str())
            .unwrap_or("{}");
        let arguments: serde_json::Value = serde_json::from_str(raw_args)
            .map_err(|e| ModelError::MalformedOutput(format!("tool arguments: {e}")))?;

        if name == CONSENT_FUNCTION {
            let tool = arguments["tool"]
                .as_str()
                .ok_or_else(|| ModelError::MalformedOutput("consent request missing tool".into()))?;
            let prompt = arguments["prompt"].as_str().unwrap_or("May I proceed?");
            return Ok(ProposedAction::ConsentRequest {
                tool: tool.to_string(),
                prompt: prompt.to_string(),
            });
        }

        return Ok(ProposedAction::ToolCall(ToolCallRequest::new(name, arguments)));
    }

    if let Some(content) = message["content"].as_str() {
        return Ok(ProposedAction::Reply { text: content.to_string() });
    }

    Err(ModelError::MalformedOutput(
        "response carries neither content nor tool calls".into(),
    ))
}

/// Embeddings-endpoint client for the retrieval index.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl HttpEmbedder {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, RetrievalError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RetrievalError::Backend(format!("client build: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: SecretString::from(api_key.into()),
            model: model.into(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(&json!({"model": self.model, "input": text}))
            .send()
            .await
            .map_err(|e| RetrievalError::Backend(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RetrievalError::Backend(format!(
                "embeddings endpoint returned {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RetrievalError::Backend(format!("response body: {e}")))?;

        body["data"][0]["embedding"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
            .ok_or_else(|| RetrievalError::Backend("missing embedding in response".into()))
    }
}
