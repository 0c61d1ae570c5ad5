//! Output contract for the generation engine.
//!
//! Raw payloads are checked against a fixed JSON schema, then converted into
//! the closed `CostEstimate` type. Nothing unvalidated leaves this module.

use jsonschema::Validator;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::{EngineError, EngineResult};
use crate::store::{Confidence, CostEstimate, LineItem};

pub fn estimate_schema() -> Value {
    json!({
        "type": "object",
        "required": ["line_items", "total", "confidence"],
        "properties": {
            "line_items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["description", "amount"],
                    "properties": {
                        "description": { "type": "string", "minLength": 1 },
                        "amount": { "type": "number", "minimum": 0 },
                        "hours": { "type": ["number", "null"], "minimum": 0 }
                    }
                }
            },
            "total": { "type": "number", "minimum": 0 },
            "confidence": { "type": "string", "enum": ["low", "medium", "high"] },
            "currency": { "type": "string", "minLength": 1 },
            "machine_type": { "type": ["string", "null"] },
            "material": { "type": ["string", "null"] },
            "complexity": { "type": ["string", "null"] },
            "working_time_hours": { "type": ["number", "null"], "minimum": 0 },
            "reasoning": { "type": ["string", "null"] }
        }
    })
}

#[derive(Deserialize)]
struct RawLineItem {
    description: String,
    amount: f64,
    #[serde(default)]
    hours: Option<f64>,
}

#[derive(Deserialize)]
struct RawEstimate {
    line_items: Vec<RawLineItem>,
    total: f64,
    confidence: Confidence,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    machine_type: Option<String>,
    #[serde(default)]
    material: Option<String>,
    #[serde(default)]
    complexity: Option<String>,
    #[serde(default)]
    working_time_hours: Option<f64>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct EstimateValidator {
    validator: Validator,
}

impl EstimateValidator {
    pub fn new() -> EngineResult<Self> {
        let validator = jsonschema::validator_for(&estimate_schema())
            .map_err(|e| EngineError::Internal(format!("invalid estimate schema: {e}")))?;
        Ok(Self { validator })
    }

    /// Validate `raw` and convert it. A payload without a currency gets
    /// `default_currency`.
    pub fn parse(&self, raw: &Value, default_currency: &str) -> EngineResult<CostEstimate> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(raw)
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(EngineError::SchemaValidation(errors.join("; ")));
        }

        let parsed: RawEstimate = serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::SchemaValidation(e.to_string()))?;

        let estimate = CostEstimate {
            line_items: parsed
                .line_items
                .into_iter()
                .map(|item| LineItem {
                    description: item.description,
                    amount: item.amount,
                    hours: item.hours,
                })
                .collect(),
            total: parsed.total,
            confidence: parsed.confidence,
            currency: parsed
                .currency
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| default_currency.to_string()),
            machine_type: parsed.machine_type,
            material: parsed.material,
            complexity: parsed.complexity,
            working_time_hours: parsed.working_time_hours,
            reasoning: parsed.reasoning,
        };

        estimate
            .validate()
            .map_err(|e| EngineError::SchemaValidation(e.to_string()))?;
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> EstimateValidator {
        EstimateValidator::new().unwrap()
    }

    #[test]
    fn accepts_a_complete_payload() {
        let raw = json!({
            "line_items": [
                { "description": "laser cutting", "amount": 40.0, "hours": 0.5 },
                { "description": "bending", "amount": 25 }
            ],
            "total": 65,
            "confidence": "medium",
            "machine_type": "laser",
            "working_time_hours": 1.5,
            "reasoning": "close to example 1"
        });

        let estimate = validator().parse(&raw, "EUR").unwrap();
        assert_eq!(estimate.line_items.len(), 2);
        assert_eq!(estimate.line_items[0].hours, Some(0.5));
        assert_eq!(estimate.total, 65.0);
        assert_eq!(estimate.confidence, Confidence::Medium);
        assert_eq!(estimate.currency, "EUR");
        assert_eq!(estimate.machine_type.as_deref(), Some("laser"));
    }

    #[test]
    fn missing_total_is_a_schema_error() {
        let raw = json!({
            "line_items": [{ "description": "x", "amount": 1 }],
            "confidence": "high"
        });
        let err = validator().parse(&raw, "EUR").unwrap_err();
        assert!(matches!(err, EngineError::SchemaValidation(_)));
    }

    #[test]
    fn rejects_negative_amounts_and_unknown_confidence() {
        let negative = json!({
            "line_items": [{ "description": "x", "amount": -5 }],
            "total": 0,
            "confidence": "low"
        });
        assert!(validator().parse(&negative, "EUR").is_err());

        let bad_confidence = json!({
            "line_items": [],
            "total": 10,
            "confidence": "certain"
        });
        assert!(validator().parse(&bad_confidence, "EUR").is_err());

        assert!(validator().parse(&json!("just text"), "EUR").is_err());
    }

    #[test]
    fn explicit_currency_wins_over_default() {
        let raw = json!({
            "line_items": [],
            "total": 10,
            "confidence": "low",
            "currency": "USD"
        });
        assert_eq!(validator().parse(&raw, "EUR").unwrap().currency, "USD");
    }
}
