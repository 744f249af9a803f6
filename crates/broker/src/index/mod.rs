//! Tool catalog persistence: FTS index, embeddings, change detection,
//! co-occurrence counters.

pub mod embedding;
pub mod hash;
pub mod snapshot;
pub mod store;

pub use embedding::{EmbeddingGenerator, NoopEmbedder, cosine_similarity};
pub use hash::schema_hash;
pub use snapshot::{ToolChanges, ToolSnapshot, detect_changes};
pub use store::{BundleSuggestion, IndexStore};
