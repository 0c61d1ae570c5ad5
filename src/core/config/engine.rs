//! Typed engine settings derived from the merged YAML config.
//!
//! Every value has a default and out-of-range values are clamped, so a
//! missing or partial config file still yields a usable engine.

use std::time::Duration;

use serde_json::Value;

use crate::core::retry::RetryPolicy;

pub const DEFAULT_TOP_K: usize = 3;
pub const MAX_TOP_K: usize = 10;
pub const DEFAULT_SCHEMA_RETRIES: u32 = 2;
pub const DEFAULT_DIMENSION: usize = 768;

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Matches scoring below this are dropped. -1.0 keeps everything.
    pub min_similarity: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: DEFAULT_TOP_K,
            min_similarity: -1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Extra generation attempts after a schema failure.
    pub schema_retries: u32,
    pub currency: String,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            schema_retries: DEFAULT_SCHEMA_RETRIES,
            currency: "EUR".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Pending examples younger than this are assumed to be mid-conversion.
    pub grace_period: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            grace_period: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub vision_model: String,
    pub embedding_model: String,
    pub generation_model: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub synthesis: SynthesisConfig,
    pub retry: RetryPolicy,
    pub dimension: usize,
    pub reconcile: ReconcileConfig,
    pub provider: ProviderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            synthesis: SynthesisConfig::default(),
            retry: RetryPolicy::default(),
            dimension: DEFAULT_DIMENSION,
            reconcile: ReconcileConfig::default(),
            provider: ProviderConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_value(config: &Value) -> Self {
        let defaults = Self::default();

        let top_k = section_u64(config, "retrieval", "top_k")
            .unwrap_or(DEFAULT_TOP_K as u64)
            .clamp(1, MAX_TOP_K as u64) as usize;
        let min_similarity = config
            .get("retrieval")
            .and_then(|v| v.get("min_similarity"))
            .and_then(|v| v.as_f64())
            .unwrap_or(-1.0)
            .clamp(-1.0, 1.0) as f32;

        let schema_retries = section_u64(config, "synthesis", "schema_retries")
            .unwrap_or(DEFAULT_SCHEMA_RETRIES as u64)
            .clamp(0, 5) as u32;
        let currency = section_str(config, "synthesis", "currency")
            .filter(|c| c.len() == 3)
            .map(|c| c.to_ascii_uppercase())
            .unwrap_or(defaults.synthesis.currency);

        let base = defaults.retry;
        let max_attempts = section_u64(config, "retry", "max_attempts")
            .map(|v| v.clamp(1, 10) as u32)
            .unwrap_or(base.max_attempts);
        let initial_delay = section_u64(config, "retry", "initial_delay_ms")
            .map(|v| Duration::from_millis(v.clamp(1, 60_000)))
            .unwrap_or(base.initial_delay);
        let max_delay = section_u64(config, "retry", "max_delay_ms")
            .map(Duration::from_millis)
            .unwrap_or(base.max_delay)
            .max(initial_delay);
        let call_timeout = section_u64(config, "retry", "call_timeout_secs")
            .map(|v| Duration::from_secs(v.clamp(1, 600)))
            .unwrap_or(base.call_timeout);
        let request_deadline = section_u64(config, "retry", "request_deadline_secs")
            .map(|v| Duration::from_secs(v.clamp(1, 3_600)))
            .unwrap_or(base.request_deadline);

        let dimension = section_u64(config, "vector", "dimension")
            .unwrap_or(DEFAULT_DIMENSION as u64)
            .clamp(1, 8_192) as usize;

        let interval = section_u64(config, "reconcile", "interval_secs")
            .map(|v| Duration::from_secs(v.clamp(1, 86_400)))
            .unwrap_or(defaults.reconcile.interval);
        let grace_period = section_u64(config, "reconcile", "grace_period_secs")
            .map(|v| Duration::from_secs(v.min(86_400)))
            .unwrap_or(defaults.reconcile.grace_period);

        let provider = ProviderConfig {
            base_url: section_str(config, "provider", "base_url")
                .map(|url| url.trim_end_matches('/').to_string()),
            vision_model: section_str(config, "provider", "vision_model")
                .unwrap_or_else(|| "vision".to_string()),
            embedding_model: section_str(config, "provider", "embedding_model")
                .unwrap_or_else(|| "embedding".to_string()),
            generation_model: section_str(config, "provider", "generation_model")
                .unwrap_or_else(|| "generation".to_string()),
            api_key: section_str(config, "provider", "api_key").filter(|k| !k.is_empty()),
        };

        Self {
            retrieval: RetrievalConfig {
                top_k,
                min_similarity,
            },
            synthesis: SynthesisConfig {
                schema_retries,
                currency,
            },
            retry: RetryPolicy {
                max_attempts,
                initial_delay,
                max_delay,
                call_timeout,
                request_deadline,
            },
            dimension,
            reconcile: ReconcileConfig {
                interval,
                grace_period,
            },
            provider,
        }
    }
}

fn section_u64(config: &Value, section: &str, key: &str) -> Option<u64> {
    config
        .get(section)
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_u64())
}

fn section_str(config: &Value, section: &str, key: &str) -> Option<String> {
    config
        .get(section)
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_config_yields_defaults() {
        let config = EngineConfig::from_value(&json!({}));
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.synthesis.schema_retries, 2);
        assert_eq!(config.synthesis.currency, "EUR");
        assert_eq!(config.dimension, 768);
        assert!(config.provider.base_url.is_none());
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let config = EngineConfig::from_value(&json!({
            "retrieval": { "top_k": 50, "min_similarity": 3.0 },
            "synthesis": { "schema_retries": 9, "currency": "usd" },
            "retry": { "initial_delay_ms": 2000, "max_delay_ms": 10 }
        }));
        assert_eq!(config.retrieval.top_k, 10);
        assert_eq!(config.retrieval.min_similarity, 1.0);
        assert_eq!(config.synthesis.schema_retries, 5);
        assert_eq!(config.synthesis.currency, "USD");
        assert_eq!(config.retry.max_delay, config.retry.initial_delay);
    }

    #[test]
    fn provider_section_is_trimmed() {
        let config = EngineConfig::from_value(&json!({
            "provider": { "base_url": "http://localhost:1234/", "api_key": "" }
        }));
        assert_eq!(
            config.provider.base_url.as_deref(),
            Some("http://localhost:1234")
        );
        assert!(config.provider.api_key.is_none());
    }
}
