//! VectorIndex trait — abstract interface for embedding index backends.
//!
//! The index holds only `(id, vector)` pairs. It is derived state: every
//! vector it stores can be rebuilt from the metadata store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::errors::{EngineError, EngineResult};

/// One nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    /// Cosine similarity in [-1, 1], higher = closer.
    pub score: f32,
}

/// Abstract trait for embedding index backends.
///
/// Implementations must:
/// - fix the dimension at creation and reject other lengths
/// - order `query` results by descending similarity, newer insertions first on ties
/// - return `min(k, count)` hits and an empty list for an empty index
/// - treat `insert` of an existing id as a replace that refreshes its recency
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Dimension fixed when the index was created.
    fn dimension(&self) -> usize;

    async fn insert(&self, id: &str, vector: &[f32]) -> EngineResult<()>;

    async fn query(&self, vector: &[f32], k: usize) -> EngineResult<Vec<VectorMatch>>;

    /// Returns whether an entry was removed.
    async fn delete(&self, id: &str) -> EngineResult<bool>;

    async fn ids(&self) -> EngineResult<Vec<String>>;

    async fn count(&self) -> EngineResult<usize>;
}

pub(crate) fn check_vector(expected: usize, vector: &[f32]) -> EngineResult<()> {
    if vector.len() != expected {
        return Err(EngineError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::InvalidInput(
            "vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}
