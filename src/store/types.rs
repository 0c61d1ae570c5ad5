use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{EngineError, EngineResult};

/// Current time at the precision the stores persist.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<f64>,
}

impl LineItem {
    pub fn new(description: impl Into<String>, amount: f64) -> Self {
        Self {
            description: description.into(),
            amount,
            hours: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Verified actual cost of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub line_items: Vec<LineItem>,
    pub total: f64,
    pub currency: String,
}

impl CostBreakdown {
    pub fn new(line_items: Vec<LineItem>, total: f64, currency: impl Into<String>) -> Self {
        Self {
            line_items,
            total,
            currency: currency.into(),
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        validate_amounts(&self.line_items, self.total)?;
        if self.currency.trim().is_empty() {
            return Err(EngineError::InvalidInput("currency must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Schema-validated output of the generation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub line_items: Vec<LineItem>,
    pub total: f64,
    pub confidence: Confidence,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_time_hours: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl CostEstimate {
    pub fn validate(&self) -> EngineResult<()> {
        validate_amounts(&self.line_items, self.total)?;
        if let Some(hours) = self.working_time_hours {
            if !hours.is_finite() || hours < 0.0 {
                return Err(EngineError::InvalidInput(
                    "working_time_hours must be a non-negative number".to_string(),
                ));
            }
        }
        Ok(())
    }
}

fn validate_amounts(items: &[LineItem], total: f64) -> EngineResult<()> {
    if !total.is_finite() || total < 0.0 {
        return Err(EngineError::InvalidInput(format!(
            "total must be a non-negative number, got {total}"
        )));
    }
    for item in items {
        if !item.amount.is_finite() || item.amount < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "line item '{}' has invalid amount {}",
                item.description, item.amount
            )));
        }
        if let Some(hours) = item.hours {
            if !hours.is_finite() || hours < 0.0 {
                return Err(EngineError::InvalidInput(format!(
                    "line item '{}' has invalid hours {}",
                    item.description, hours
                )));
            }
        }
    }
    Ok(())
}

/// Description text and embedding derived from a drawing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingAnalysis {
    pub description: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedExample {
    pub example_id: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExampleState {
    /// Written but not yet guaranteed to have a vector; invisible to retrieval.
    Pending,
    Committed,
}

impl ExampleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExampleState::Pending => "pending",
            ExampleState::Committed => "committed",
        }
    }
}

impl FromStr for ExampleState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExampleState::Pending),
            "committed" => Ok(ExampleState::Committed),
            other => Err(EngineError::Storage(format!("unknown example state '{other}'"))),
        }
    }
}

/// Human labels attached to a learning example.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExampleLabels {
    pub title: Option<String>,
    pub notes: Option<String>,
    pub machine_type: Option<String>,
    pub material: Option<String>,
    pub complexity: Option<String>,
    pub working_time_hours: Option<f64>,
}

impl ExampleLabels {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Fill unset job attributes from a generated estimate.
    pub fn or_from_estimate(mut self, estimate: Option<&CostEstimate>) -> Self {
        if let Some(estimate) = estimate {
            self.machine_type = self.machine_type.or_else(|| estimate.machine_type.clone());
            self.material = self.material.or_else(|| estimate.material.clone());
            self.complexity = self.complexity.or_else(|| estimate.complexity.clone());
            self.working_time_hours = self.working_time_hours.or(estimate.working_time_hours);
        }
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if let Some(hours) = self.working_time_hours {
            if !hours.is_finite() || hours < 0.0 {
                return Err(EngineError::InvalidInput(
                    "working_time_hours must be a non-negative number".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningExample {
    pub id: String,
    pub description_text: String,
    pub embedding: Vec<f32>,
    pub cost_breakdown: CostBreakdown,
    pub created_at: DateTime<Utc>,
    /// `None` for examples taught directly rather than converted from a quote.
    pub source_quote_id: Option<String>,
    #[serde(flatten)]
    pub labels: ExampleLabels,
    pub state: ExampleState,
}

impl LearningExample {
    pub fn is_committed(&self) -> bool {
        self.state == ExampleState::Committed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteStatus {
    Draft,
    Finalized,
    Converted,
}

impl QuoteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuoteStatus::Draft => "draft",
            QuoteStatus::Finalized => "finalized",
            QuoteStatus::Converted => "converted",
        }
    }

    /// Only `draft -> finalized -> converted`; `converted` is terminal.
    pub fn can_transition_to(&self, next: QuoteStatus) -> bool {
        matches!(
            (self, next),
            (QuoteStatus::Draft, QuoteStatus::Finalized)
                | (QuoteStatus::Finalized, QuoteStatus::Converted)
        )
    }
}

impl fmt::Display for QuoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuoteStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(QuoteStatus::Draft),
            "finalized" => Ok(QuoteStatus::Finalized),
            "converted" => Ok(QuoteStatus::Converted),
            other => Err(EngineError::InvalidInput(format!("unknown quote status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub id: String,
    pub drawing_ref: String,
    pub analysis: DrawingAnalysis,
    /// Most similar first.
    pub retrieved: Vec<RetrievedExample>,
    pub generated_estimate: Option<CostEstimate>,
    pub needs_manual_estimate: bool,
    pub status: QuoteStatus,
    pub actual_cost: Option<CostBreakdown>,
    pub example_id: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Quote {
    /// A fresh draft. A missing estimate flags the quote for manual entry.
    pub fn draft(
        drawing_ref: impl Into<String>,
        analysis: DrawingAnalysis,
        retrieved: Vec<RetrievedExample>,
        generated_estimate: Option<CostEstimate>,
    ) -> Self {
        let now = now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            drawing_ref: drawing_ref.into(),
            analysis,
            retrieved,
            needs_manual_estimate: generated_estimate.is_none(),
            generated_estimate,
            status: QuoteStatus::Draft,
            actual_cost: None,
            example_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn retrieved_example_ids(&self) -> Vec<&str> {
        self.retrieved.iter().map(|r| r.example_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleCounts {
    pub pending: u64,
    pub committed: u64,
}

/// Committed examples grouped by job attribute. Unlabelled examples are
/// counted under [`UNSPECIFIED`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleBreakdown {
    pub by_machine_type: BTreeMap<String, u64>,
    pub by_complexity: BTreeMap<String, u64>,
}

pub const UNSPECIFIED: &str = "unspecified";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteCounts {
    pub draft: u64,
    pub finalized: u64,
    pub converted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_status_allows_only_forward_steps() {
        use QuoteStatus::*;
        assert!(Draft.can_transition_to(Finalized));
        assert!(Finalized.can_transition_to(Converted));

        for (from, to) in [
            (Draft, Converted),
            (Draft, Draft),
            (Finalized, Draft),
            (Finalized, Finalized),
            (Converted, Draft),
            (Converted, Finalized),
            (Converted, Converted),
        ] {
            assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
        }
    }

    #[test]
    fn cost_breakdown_rejects_negative_or_non_finite_amounts() {
        let ok = CostBreakdown::new(vec![LineItem::new("milling", 120.0)], 120.0, "EUR");
        assert!(ok.validate().is_ok());

        let negative = CostBreakdown::new(vec![LineItem::new("milling", -1.0)], 0.0, "EUR");
        assert!(matches!(negative.validate(), Err(EngineError::InvalidInput(_))));

        let nan_total = CostBreakdown::new(vec![], f64::NAN, "EUR");
        assert!(nan_total.validate().is_err());

        let no_currency = CostBreakdown::new(vec![], 10.0, " ");
        assert!(no_currency.validate().is_err());
    }

    #[test]
    fn confidence_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Confidence::High).unwrap(), "\"high\"");
        let parsed: Confidence = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(parsed, Confidence::Low);
    }

    #[test]
    fn draft_without_estimate_needs_manual_entry() {
        let analysis = DrawingAnalysis {
            description: "flange".to_string(),
            embedding: vec![1.0, 0.0],
        };
        let quote = Quote::draft("drawing-1.png", analysis, vec![], None);
        assert_eq!(quote.status, QuoteStatus::Draft);
        assert!(quote.needs_manual_estimate);
        assert_eq!(quote.version, 1);
    }

    #[test]
    fn labels_keep_explicit_values_over_estimate() {
        let estimate = CostEstimate {
            line_items: vec![LineItem::new("turning", 90.0)],
            total: 90.0,
            confidence: Confidence::Medium,
            currency: "EUR".to_string(),
            machine_type: Some("lathe".to_string()),
            material: Some("brass".to_string()),
            complexity: Some("low".to_string()),
            working_time_hours: Some(1.5),
            reasoning: None,
        };
        let labels = ExampleLabels {
            material: Some("bronze".to_string()),
            ..ExampleLabels::titled("Bushing")
        }
        .or_from_estimate(Some(&estimate));

        assert_eq!(labels.title.as_deref(), Some("Bushing"));
        assert_eq!(labels.machine_type.as_deref(), Some("lathe"));
        assert_eq!(labels.material.as_deref(), Some("bronze"));
        assert_eq!(labels.working_time_hours, Some(1.5));
        assert_eq!(ExampleLabels::default().or_from_estimate(None), ExampleLabels::default());
    }
}
