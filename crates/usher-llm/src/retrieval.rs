use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use usher_core::retrieval::{RetrievalError, RetrievalHit, Retriever};

/// Turns text into a vector. The production implementation calls an
/// embeddings endpoint; tests plug in a deterministic toy.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError>;
}

/// A document with its precomputed embedding.
#[derive(Clone, Debug)]
pub struct Document {
    pub content: String,
    pub embedding: Vec<f32>,
}

/// In-memory cosine-similarity index over named corpora. Documents are
/// embedded once at load; queries are embedded per search.
pub struct VectorIndex {
    corpora: HashMap<String, Vec<Document>>,
    embedder: Arc<dyn Embedder>,
}

impl VectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            corpora: HashMap::new(),
            embedder,
        }
    }

    /// Embed and add the given texts under a corpus name.
    pub async fn load_corpus(
        &mut self,
        name: impl Into<String>,
        texts: Vec<String>,
    ) -> Result<usize, RetrievalError> {
        let mut docs = Vec::with_capacity(texts.len());
        for text in texts {
            let embedding = self.embedder.embed(&text).await?;
            docs.push(Document { content: text, embedding });
        }
        let count = docs.len();
        self.corpora.insert(name.into(), docs);
        Ok(count)
    }

    /// Add pre-embedded documents under a corpus name.
    pub fn add_corpus(&mut self, name: impl Into<String>, docs: Vec<Document>) {
        self.corpora.insert(name.into(), docs);
    }

    pub fn corpus_len(&self, name: &str) -> Option<usize> {
        self.corpora.get(name).map(Vec::len)
    }
}

#[async_trait]
impl Retriever for VectorIndex {
    async fn search(
        &self,
        query: &str,
        corpus: &str,
        k: usize,
    ) -> Result<Vec<RetrievalHit>, RetrievalError> {
        let docs = self
            .corpora
            .get(corpus)
            .ok_or_else(|| RetrievalError::UnknownCorpus(corpus.to_string()))?;

        let query_emb = self.embedder.embed(query).await?;

        let mut scored: Vec<RetrievalHit> = docs
            .iter()
            .map(|doc| RetrievalHit {
                content: doc.content.clone(),
                score: cosine_similarity(&query_emb, &doc.embedding),
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
