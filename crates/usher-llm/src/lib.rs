pub mod http;
pub mod mock;
pub mod reliable;
pub mod retrieval;

pub use http::{HttpEmbedder, HttpModel, HttpModelConfig};
pub use mock::{MockModel, MockReply};
pub use reliable::{ReliableConfig, ReliableModel};
pub use retrieval::{Document, Embedder, VectorIndex};
