use serde_json::{Map, Value};

use crate::core::errors::EngineError;

pub fn validate_config(config: &Value) -> Result<(), EngineError> {
    let root = config
        .as_object()
        .ok_or_else(|| config_type_error("root", "object"))?;

    if let Some(retrieval) = expect_optional_object(root, "retrieval")? {
        validate_u64_field(retrieval, "retrieval.top_k", "top_k", 1, 10)?;
        validate_f64_field(
            retrieval,
            "retrieval.min_similarity",
            "min_similarity",
            -1.0,
            1.0,
        )?;
    }

    if let Some(synthesis) = expect_optional_object(root, "synthesis")? {
        validate_u64_field(synthesis, "synthesis.schema_retries", "schema_retries", 0, 5)?;
        validate_optional_string_field(synthesis, "synthesis.currency", "currency")?;
    }

    if let Some(retry) = expect_optional_object(root, "retry")? {
        validate_u64_field(retry, "retry.max_attempts", "max_attempts", 1, 10)?;
        validate_u64_field(
            retry,
            "retry.initial_delay_ms",
            "initial_delay_ms",
            1,
            60_000,
        )?;
        validate_u64_field(retry, "retry.max_delay_ms", "max_delay_ms", 1, 600_000)?;
        validate_u64_field(
            retry,
            "retry.call_timeout_secs",
            "call_timeout_secs",
            1,
            600,
        )?;
        validate_u64_field(
            retry,
            "retry.request_deadline_secs",
            "request_deadline_secs",
            1,
            3_600,
        )?;
    }

    if let Some(vector) = expect_optional_object(root, "vector")? {
        validate_u64_field(vector, "vector.dimension", "dimension", 1, 8_192)?;
    }

    if let Some(reconcile) = expect_optional_object(root, "reconcile")? {
        validate_u64_field(
            reconcile,
            "reconcile.interval_secs",
            "interval_secs",
            1,
            86_400,
        )?;
        validate_u64_field(
            reconcile,
            "reconcile.grace_period_secs",
            "grace_period_secs",
            0,
            86_400,
        )?;
    }

    if let Some(provider) = expect_optional_object(root, "provider")? {
        for key in [
            "base_url",
            "vision_model",
            "embedding_model",
            "generation_model",
            "api_key",
        ] {
            validate_optional_string_field(provider, &format!("provider.{}", key), key)?;
        }
    }

    Ok(())
}

fn expect_optional_object<'a>(
    root: &'a Map<String, Value>,
    key: &str,
) -> Result<Option<&'a Map<String, Value>>, EngineError> {
    match root.get(key) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(config_type_error(key, "object")),
    }
}

fn validate_u64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: u64,
    max: u64,
) -> Result<(), EngineError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_u64() else {
        return Err(config_type_error(path, "integer"));
    };
    if number < min || number > max {
        return Err(EngineError::Config(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_f64_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
    min: f64,
    max: f64,
) -> Result<(), EngineError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    let Some(number) = value.as_f64() else {
        return Err(config_type_error(path, "number"));
    };
    if number < min || number > max {
        return Err(EngineError::Config(format!(
            "Invalid config at '{}': must be between {} and {}",
            path, min, max
        )));
    }
    Ok(())
}

fn validate_optional_string_field(
    section: &Map<String, Value>,
    path: &str,
    key: &str,
) -> Result<(), EngineError> {
    let Some(value) = section.get(key) else {
        return Ok(());
    };
    if value.as_str().is_none() {
        return Err(config_type_error(path, "string"));
    }
    Ok(())
}

fn config_type_error(path: &str, expected: &str) -> EngineError {
    EngineError::Config(format!(
        "Invalid config at '{}': expected {}",
        path, expected
    ))
}
