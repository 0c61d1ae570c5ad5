pub mod engine;
pub mod paths;
pub mod service;
pub mod validation;

pub use engine::{EngineConfig, ProviderConfig, ReconcileConfig, RetrievalConfig, SynthesisConfig};
pub use paths::AppPaths;
pub use service::ConfigService;
