use std::sync::Arc;

use crate::core::config::{AppPaths, ConfigService, EngineConfig};
use crate::engine::QuoteEngine;
use crate::providers::OpenAiCompatProvider;
use crate::store::SqliteMetadataStore;
use crate::vector::SqliteVectorIndex;

pub mod error;

use error::InitializationError;

/// Everything the daemon needs, built once at start-up.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: ConfigService,
    pub engine_config: Arc<EngineConfig>,
    pub engine: QuoteEngine,
}

impl AppState {
    /// Initializes the application state from the discovered paths.
    ///
    /// 1. Load and validate configuration
    /// 2. Open the metadata store and the vector index
    /// 3. Connect the model provider
    /// 4. Assemble the quote engine
    pub async fn initialize() -> Result<Arc<Self>, InitializationError> {
        Self::initialize_with(AppPaths::new()).await
    }

    pub async fn initialize_with(paths: AppPaths) -> Result<Arc<Self>, InitializationError> {
        let paths = Arc::new(paths);
        let config = ConfigService::new(paths.clone());

        let engine_config = config
            .load_engine_config()
            .map_err(|e| InitializationError::Config(e.into()))?;

        let store = Arc::new(
            SqliteMetadataStore::new(paths.as_ref())
                .await
                .map_err(|e| InitializationError::Metadata(e.into()))?,
        );

        let index = Arc::new(
            SqliteVectorIndex::new(paths.as_ref(), engine_config.dimension)
                .await
                .map_err(|e| InitializationError::VectorIndex(e.into()))?,
        );

        let provider = Arc::new(
            OpenAiCompatProvider::new(&engine_config.provider)
                .map_err(|e| InitializationError::Provider(e.into()))?,
        );

        let engine = QuoteEngine::new(
            engine_config.clone(),
            store,
            index,
            provider.clone(),
            provider,
        )
        .map_err(|e| InitializationError::Engine(e.into()))?;

        tracing::info!(
            data_dir = %paths.user_data_dir.display(),
            dimension = engine_config.dimension,
            top_k = engine_config.retrieval.top_k,
            "quote engine initialized"
        );

        Ok(Arc::new(AppState {
            paths,
            config,
            engine_config: Arc::new(engine_config),
            engine,
        }))
    }
}
