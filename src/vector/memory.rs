//! In-process vector index.
//!
//! Inserts are visible to queries as soon as `insert` returns; nothing is
//! shared across processes.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::index::{check_vector, VectorIndex, VectorMatch};
use super::math::top_k;
use crate::core::errors::{EngineError, EngineResult};

struct Entry {
    vector: Vec<f32>,
    seq: i64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_seq: i64,
}

pub struct MemoryVectorIndex {
    dimension: usize,
    inner: RwLock<Inner>,
}

impl MemoryVectorIndex {
    pub fn new(dimension: usize) -> EngineResult<Self> {
        if dimension == 0 {
            return Err(EngineError::InvalidInput(
                "vector dimension must be positive".to_string(),
            ));
        }
        Ok(Self {
            dimension,
            inner: RwLock::new(Inner::default()),
        })
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn insert(&self, id: &str, vector: &[f32]) -> EngineResult<()> {
        check_vector(self.dimension, vector)?;

        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let seq = inner.next_seq;
        inner.entries.insert(
            id.to_string(),
            Entry {
                vector: vector.to_vec(),
                seq,
            },
        );
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> EngineResult<Vec<VectorMatch>> {
        check_vector(self.dimension, vector)?;

        let inner = self.inner.read().await;
        Ok(top_k(
            vector,
            inner
                .entries
                .iter()
                .map(|(id, entry)| (id.as_str(), entry.vector.as_slice(), entry.seq)),
            k,
        ))
    }

    async fn delete(&self, id: &str) -> EngineResult<bool> {
        Ok(self.inner.write().await.entries.remove(id).is_some())
    }

    async fn ids(&self) -> EngineResult<Vec<String>> {
        Ok(self.inner.read().await.entries.keys().cloned().collect())
    }

    async fn count(&self) -> EngineResult<usize> {
        Ok(self.inner.read().await.entries.len())
    }
}
