use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to load configuration: {0}")]
    Config(#[source] anyhow::Error),

    #[error("Failed to initialize metadata store: {0}")]
    Metadata(#[source] anyhow::Error),

    #[error("Failed to initialize vector index: {0}")]
    VectorIndex(#[source] anyhow::Error),

    #[error("Failed to initialize model provider: {0}")]
    Provider(#[source] anyhow::Error),

    #[error("Failed to assemble quote engine: {0}")]
    Engine(#[source] anyhow::Error),
}
