//! Embedding index.
//!
//! - `VectorIndex`: the contract the engine depends on
//! - `MemoryVectorIndex`: process-local index
//! - `SqliteVectorIndex`: file-backed index shared between processes

mod index;
mod math;
mod memory;
mod sqlite;

pub use index::{VectorIndex, VectorMatch};
pub use math::cosine_similarity;
pub use memory::MemoryVectorIndex;
pub use sqlite::SqliteVectorIndex;

pub(crate) use math::{deserialize_embedding, serialize_embedding};
