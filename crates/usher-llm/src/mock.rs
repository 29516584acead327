use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use usher_core::errors::ModelError;
use usher_core::protocol::ToolCallRequest;
use usher_core::provider::{ModelProvider, PromptContext, ProposedAction};

/// Pre-programmed proposals for deterministic testing without API calls.
pub enum MockReply {
    Action(ProposedAction),
    Error(ModelError),
    /// Wait a duration, then yield the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn reply(text: &str) -> Self {
        Self::Action(ProposedAction::Reply { text: text.to_string() })
    }

    pub fn tool_call(name: &str, arguments: serde_json::Value) -> Self {
        Self::Action(ProposedAction::ToolCall(ToolCallRequest::new(name, arguments)))
    }

    pub fn consent_request(tool: &str, prompt: &str) -> Self {
        Self::Action(ProposedAction::ConsentRequest {
            tool: tool.to_string(),
            prompt: prompt.to_string(),
        })
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns scripted proposals and generations in sequence.
pub struct MockModel {
    proposals: Mutex<VecDeque<MockReply>>,
    generations: Mutex<VecDeque<Result<String, ModelError>>>,
    propose_calls: AtomicUsize,
    generate_calls: AtomicUsize,
}

impl MockModel {
    pub fn new(proposals: Vec<MockReply>) -> Self {
        Self {
            proposals: Mutex::new(proposals.into()),
            generations: Mutex::new(VecDeque::new()),
            propose_calls: AtomicUsize::new(0),
            generate_calls: AtomicUsize::new(0),
        }
    }

    /// Script the free-form generations used by the summarizer.
    pub fn with_generations(self, generations: Vec<Result<String, ModelError>>) -> Self {
        *self.generations.lock() = generations.into();
        self
    }

    pub fn propose_calls(&self) -> usize {
        self.propose_calls.load(Ordering::Relaxed)
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelProvider for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn propose(&self, _context: &PromptContext) -> Result<ProposedAction, ModelError> {
        let call = self.propose_calls.fetch_add(1, Ordering::Relaxed);
        let next = self.proposals.lock().pop_front();
        let Some(next) = next else {
            return Err(ModelError::InvalidRequest(format!(
                "MockModel: no proposal scripted for call {call}"
            )));
        };

        let mut current = next;
        loop {
            match current {
                MockReply::Action(action) => return Ok(action),
                MockReply::Error(e) => return Err(e),
                MockReply::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }

    async fn generate(&self, _prompt: &str) -> Result<String, ModelError> {
        let call = self.generate_calls.fetch_add(1, Ordering::Relaxed);
        self.generations.lock().pop_front().unwrap_or_else(|| {
            Err(ModelError::InvalidRequest(format!(
                "MockModel: no generation scripted for call {call}"
            )))
        })
    }
}
