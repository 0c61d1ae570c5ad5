//! Fakes for the capability traits, shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::errors::{EngineError, EngineResult, ProviderError};
use crate::providers::{DrawingInput, EmbeddingGenerator, GenerationEngine};
use crate::quote::ContextDocument;
use crate::store::DrawingAnalysis;
use crate::vector::{MemoryVectorIndex, VectorIndex, VectorMatch};

pub fn valid_estimate(total: f64) -> Value {
    json!({
        "line_items": [{ "description": "machining", "amount": total }],
        "total": total,
        "confidence": "medium"
    })
}

pub struct ScriptedEmbedder {
    script: Mutex<VecDeque<Result<DrawingAnalysis, ProviderError>>>,
    embedding: Vec<f32>,
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    /// Always answers with `embedding`.
    pub fn fixed(embedding: Vec<f32>) -> Self {
        Self::scripted(embedding, Vec::new())
    }

    /// Plays `script` first, then falls back to `embedding`.
    pub fn scripted(
        embedding: Vec<f32>,
        script: Vec<Result<DrawingAnalysis, ProviderError>>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            embedding,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingGenerator for ScriptedEmbedder {
    async fn analyze(&self, drawing: &DrawingInput) -> Result<DrawingAnalysis, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| {
            Ok(DrawingAnalysis {
                description: format!("analysis of {}", drawing.drawing_ref),
                embedding: self.embedding.clone(),
            })
        })
    }
}

pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Value, ProviderError>>>,
    fallback: Result<Value, ProviderError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    last_context: Mutex<Option<ContextDocument>>,
}

impl ScriptedGenerator {
    pub fn always(response: Value) -> Self {
        Self::scripted(Vec::new(), Ok(response))
    }

    pub fn scripted(
        script: Vec<Result<Value, ProviderError>>,
        fallback: Result<Value, ProviderError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            calls: AtomicUsize::new(0),
            last_context: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_context(&self) -> Option<ContextDocument> {
        self.last_context.lock().ok().and_then(|c| c.clone())
    }
}

#[async_trait]
impl GenerationEngine for ScriptedGenerator {
    async fn synthesize(&self, context: &ContextDocument) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut last) = self.last_context.lock() {
            *last = Some(context.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Memory index whose inserts can be made to fail.
pub struct FlakyIndex {
    inner: MemoryVectorIndex,
    fail_inserts: AtomicBool,
}

impl FlakyIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: MemoryVectorIndex::new(dimension).expect("dimension"),
            fail_inserts: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_inserts.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn insert(&self, id: &str, vector: &[f32]) -> EngineResult<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("index unavailable".to_string()));
        }
        self.inner.insert(id, vector).await
    }

    async fn query(&self, vector: &[f32], k: usize) -> EngineResult<Vec<VectorMatch>> {
        self.inner.query(vector, k).await
    }

    async fn delete(&self, id: &str) -> EngineResult<bool> {
        self.inner.delete(id).await
    }

    async fn ids(&self) -> EngineResult<Vec<String>> {
        self.inner.ids().await
    }

    async fn count(&self) -> EngineResult<usize> {
        self.inner.count().await
    }
}
