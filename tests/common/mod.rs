#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use genquote_backend::core::retry::RetryPolicy;
use genquote_backend::store::{
    ExampleBreakdown, ExampleCounts, MetadataStore, PendingInsert, QuoteCounts,
    SqliteMetadataStore,
};
use genquote_backend::vector::{MemoryVectorIndex, VectorIndex, VectorMatch};
use genquote_backend::{
    ContextDocument, CostBreakdown, DrawingAnalysis, DrawingInput, EmbeddingGenerator,
    EngineConfig, EngineError, EngineResult, GenerationEngine, LearningExample, LineItem,
    ProviderError, Quote, QuoteEngine, QuoteStatus,
};
use serde_json::{json, Value};

pub const DIMENSION: usize = 2;

pub fn valid_estimate(total: f64) -> Value {
    json!({
        "line_items": [
            { "description": "machining", "amount": total * 0.75, "hours": 2.0 },
            { "description": "material", "amount": total * 0.25 }
        ],
        "total": total,
        "confidence": "medium",
        "reasoning": "scaled from the closest reference job"
    })
}

pub fn drawing(name: &str) -> DrawingInput {
    DrawingInput::new(name, vec![0x25, 0x50, 0x44, 0x46], "application/pdf")
}

pub fn actual_cost(total: f64) -> CostBreakdown {
    CostBreakdown::new(vec![LineItem::new("verified job cost", total)], total, "EUR")
}

/// Embeds each drawing with the vector registered under its reference.
pub struct TableEmbedder {
    vectors: Mutex<HashMap<String, Vec<f32>>>,
    fallback: Vec<f32>,
    calls: AtomicUsize,
}

impl TableEmbedder {
    pub fn new() -> Self {
        Self {
            vectors: Mutex::new(HashMap::new()),
            fallback: vec![1.0, 0.0],
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn register(&self, drawing_ref: &str, vector: [f32; DIMENSION]) {
        self.vectors
            .lock()
            .unwrap()
            .insert(drawing_ref.to_string(), vector.to_vec());
    }
}

#[async_trait]
impl EmbeddingGenerator for TableEmbedder {
    async fn analyze(&self, drawing: &DrawingInput) -> Result<DrawingAnalysis, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let embedding = self
            .vectors
            .lock()
            .unwrap()
            .get(&drawing.drawing_ref)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());
        Ok(DrawingAnalysis {
            description: format!("technical drawing {}", drawing.drawing_ref),
            embedding,
        })
    }
}

pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<Value, ProviderError>>>,
    fallback: Mutex<Result<Value, ProviderError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    contexts: Mutex<Vec<ContextDocument>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(valid_estimate(100.0))),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Result<Value, ProviderError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn set_fallback(&self, response: Result<Value, ProviderError>) {
        *self.fallback.lock().unwrap() = response;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    pub fn last_context(&self) -> Option<ContextDocument> {
        self.contexts.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl GenerationEngine for ScriptedGenerator {
    async fn synthesize(&self, context: &ContextDocument) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
    }
}

/// Memory index whose inserts can be switched off.
pub struct FlakyIndex {
    inner: MemoryVectorIndex,
    failing: AtomicBool,
}

impl FlakyIndex {
    pub fn new() -> Self {
        Self {
            inner: MemoryVectorIndex::new(DIMENSION).unwrap(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorIndex for FlakyIndex {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn insert(&self, id: &str, vector: &[f32]) -> EngineResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("vector index unreachable".to_string()));
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

/// SQLite store whose example commits can be switched off.
pub struct FlakyStore {
    inner: SqliteMetadataStore,
    failing_commit: AtomicBool,
}

impl FlakyStore {
    pub async fn open(dir: &Path) -> Self {
        Self {
            inner: SqliteMetadataStore::with_path(dir.join("quotes.db"))
                .await
                .unwrap(),
            failing_commit: AtomicBool::new(false),
        }
    }

    pub fn set_failing_commit(&self, failing: bool) {
        self.failing_commit.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn insert_pending_example(
        &self,
        example: &LearningExample,
    ) -> EngineResult<PendingInsert> {
        self.inner.insert_pending_example(example).await
    }

    async fn mark_example_committed(&self, id: &str) -> EngineResult<()> {
        if self.failing_commit.load(Ordering::SeqCst) {
            return Err(EngineError::Storage("metadata store unreachable".to_string()));
        }
        self.inner.mark_example_committed(id).await
    }

    async fn get_example(&self, id: &str) -> EngineResult<Option<LearningExample>> {
        self.inner.get_example(id).await
    }

    async fn get_committed_examples(&self, ids: &[String]) -> EngineResult<Vec<LearningExample>> {
        self.inner.get_committed_examples(ids).await
    }

    async fn find_example_by_source_quote(
        &self,
        quote_id: &str,
    ) -> EngineResult<Option<LearningExample>> {
        self.inner.find_example_by_source_quote(quote_id).await
    }

    async fn list_pending_examples(
        &self,
        older_than: DateTime<Utc>,
    ) -> EngineResult<Vec<LearningExample>> {
        self.inner.list_pending_examples(older_than).await
    }

    async fn list_committed_examples(&self) -> EngineResult<Vec<LearningExample>> {
        self.inner.list_committed_examples().await
    }

    async fn delete_pending_example(&self, id: &str) -> EngineResult<bool> {
        self.inner.delete_pending_example(id).await
    }

    async fn list_examples(
        &self,
        machine_type: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<LearningExample>> {
        self.inner.list_examples(machine_type, limit, offset).await
    }

    async fn delete_example(&self, id: &str) -> EngineResult<bool> {
        self.inner.delete_example(id).await
    }

    async fn count_examples(&self) -> EngineResult<ExampleCounts> {
        self.inner.count_examples().await
    }

    async fn example_breakdown(&self) -> EngineResult<ExampleBreakdown> {
        self.inner.example_breakdown().await
    }

    async fn insert_quote(&self, quote: &Quote) -> EngineResult<()> {
        self.inner.insert_quote(quote).await
    }

    async fn get_quote(&self, id: &str) -> EngineResult<Option<Quote>> {
        self.inner.get_quote(id).await
    }

    async fn update_quote(&self, quote: &Quote, expected_version: i64) -> EngineResult<Quote> {
        self.inner.update_quote(quote, expected_version).await
    }

    async fn delete_draft_quote(&self, id: &str, expected_version: i64) -> EngineResult<()> {
        self.inner.delete_draft_quote(id, expected_version).await
    }

    async fn list_quotes(
        &self,
        status: Option<QuoteStatus>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<Quote>> {
        self.inner.list_quotes(status, limit, offset).await
    }

    async fn count_quotes(&self) -> EngineResult<QuoteCounts> {
        self.inner.count_quotes().await
    }
}

pub struct Harness {
    pub engine: QuoteEngine,
    pub embedder: Arc<TableEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
    pub index: Arc<FlakyIndex>,
    pub store: Arc<FlakyStore>,
    _dir: tempfile::TempDir,
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.dimension = DIMENSION;
    config.retrieval.top_k = 2;
    config.retry = RetryPolicy {
        max_attempts: 3,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        call_timeout: Duration::from_secs(5),
        request_deadline: Duration::from_secs(20),
    };
    config.reconcile.grace_period = Duration::ZERO;
    config
}

pub async fn harness() -> Harness {
    harness_with(test_config()).await
}

pub async fn harness_with(config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FlakyStore::open(dir.path()).await);
    let embedder = Arc::new(TableEmbedder::new());
    let generator = Arc::new(ScriptedGenerator::new());
    let index = Arc::new(FlakyIndex::new());

    let engine = QuoteEngine::new(
        config,
        store.clone(),
        index.clone(),
        embedder.clone(),
        generator.clone(),
    )
    .unwrap();

    Harness {
        engine,
        embedder,
        generator,
        index,
        store,
        _dir: dir,
    }
}
