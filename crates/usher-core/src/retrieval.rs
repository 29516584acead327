use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One retrieved document. Higher score is a better match.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub content: String,
    pub score: f32,
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("unknown corpus: {0}")]
    UnknownCorpus(String),
    #[error("retrieval backend error: {0}")]
    Backend(String),
}

/// Read-only vector-similarity search boundary. No session-state effect.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return the top `k` hits for `query` in `corpus`, best first.
    async fn search(
        &self,
        query: &str,
        corpus: &str,
        k: usize,
    ) -> Result<Vec<RetrievalHit>, RetrievalError>;
}
